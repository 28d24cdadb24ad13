use thiserror::Error;

use crate::message::{MessageError, PeerId};
use crate::transport::TransportError;

/// Errors that can occur inside the mesh node.
#[derive(Debug, Error)]
pub enum PeerError {
    /// A send targeted a closed or unknown connection.
    #[error("unknown transport to {0}")]
    UnknownTransport(PeerId),

    /// Session negotiation with a remote failed; only the affected
    /// connection is torn down.
    #[error("handshake with {remote} failed: {source}")]
    Handshake {
        remote: PeerId,
        source: TransportError,
    },

    /// The envelope could not be serialized or was malformed.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// The underlying channel rejected a frame.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
