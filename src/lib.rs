//! swarmcast - peer-to-peer segmented media distribution
//!
//! This library implements the client core of a peer-to-peer overlay for
//! cooperative media downloading. Peers form an unstructured mesh over a
//! message-oriented duplex transport, discover one another through a
//! gossip-based random peer sampling protocol, and fetch a video file in
//! numbered parts from whichever peer holds them, falling back to the
//! origin server when no peer does.
//!
//! # Modules
//!
//! - [`message`] - The JSON wire envelope and message taxonomy
//! - [`bus`] - Typed publish/subscribe used to glue the subsystems
//! - [`transport`] - Contracts for the duplex transport and signaling link
//! - [`peer`] - The mesh node: routing, forwarding, handshake, retry queue
//! - [`gossip`] - Random peer sampling engine and node descriptors
//! - [`media`] - Segmented media fetcher: metadata, parts, chunking
//! - [`origin`] - Byte-range HTTP client for the origin server
//! - [`config`] - Construction-time configuration

pub mod bus;
pub mod config;
pub mod gossip;
pub mod media;
pub mod message;
pub mod origin;
pub mod peer;
pub mod transport;

pub use bus::{ListenerId, MessageBus};
pub use config::{Config, ExtensionConfig, MediaConfig, PeerSettings, RpsConfig, SelectionPolicy};
pub use gossip::{Descriptor, ExchangeRole, RpsEngine, View};
pub use media::{
    Cluster, Media, MediaError, MediaFetcher, MediaMetadata, Part, PartRef, PartSource,
    PartStatus, PlaybackSink,
};
pub use message::{Message, MessageError, MessageType, PeerId};
pub use origin::{OriginClient, OriginError, OriginFetch};
pub use peer::{
    Connection, ConnectionState, DeliveryStatus, Peer, PeerBuilder, PeerError, PeerHandle,
    PeerStats,
};
pub use transport::{
    Endpoint, IceCandidate, LinkEvent, SdpKind, SessionDescription, SignalChannel, Transport,
    TransportError,
};
