//! The mesh node.
//!
//! This module implements TTL-bounded routing, forwarding and broadcast
//! over the duplex transport, the three-way connection-establishment
//! handshake, and the retry queue for messages that cannot yet be
//! delivered.

mod connection;
mod error;
mod node;
mod retry;

pub use connection::{Connection, ConnectionState, Links};
pub use error::PeerError;
pub use node::{Peer, PeerBuilder, PeerHandle, PeerStats};
pub use retry::{DeliveryStatus, RetryEntry, RetryQueue};

#[cfg(test)]
mod tests;
