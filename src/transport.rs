//! Contracts for the external transport collaborators.
//!
//! The core does not implement a transport. It drives connection
//! establishment through the [`Transport`]/[`Endpoint`] traits (in the
//! reference deployment these wrap WebRTC peer connections and data
//! channels) and receives channel lifecycle notifications as
//! [`LinkEvent`]s on a per-peer basis. The signaling rendezvous is the
//! same idea reduced to an already-open duplex pipe, [`SignalChannel`].

pub mod mem;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::PeerId;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel is closed or was never opened.
    #[error("channel closed")]
    Closed,

    /// Session negotiation failed (bad description, gathering error).
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// A candidate was applied before the remote description.
    #[error("no remote description")]
    NoRemoteDescription,
}

/// Which side of the negotiation a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An opaque session description produced by one endpoint and applied at
/// the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub blob: String,
}

/// An opaque connectivity candidate, relayed through the mesh while a
/// connection is being established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub blob: String,
}

/// Lifecycle and traffic notifications for one channel.
///
/// Events are delivered as `(remote, event)` pairs on the sender handed to
/// [`Transport::open`]; `Candidate` carries a locally gathered candidate
/// that the peer must relay to the remote side.
#[derive(Debug)]
pub enum LinkEvent {
    Open,
    Message(Bytes),
    Candidate(IceCandidate),
    Closed,
    Error(String),
}

/// Sender on which a transport reports `(remote, event)` pairs.
pub type LinkEventSender = mpsc::UnboundedSender<(PeerId, LinkEvent)>;

/// One negotiable duplex channel to a single remote peer.
///
/// The handshake sequence is split between the two roles: the responder
/// calls [`Endpoint::create_offer`], the requester answers it with
/// [`Endpoint::create_answer`] (which also applies the offer as the
/// remote description), and the responder finally applies the answer via
/// [`Endpoint::set_remote_description`]. Candidates may only be added
/// once the remote description is in place.
pub trait Endpoint: Send {
    /// Generates this side's offer and installs it as the local
    /// description.
    fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    /// Applies the remote offer and generates the answering description.
    fn create_answer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Applies the remote description (the answer, on the offering side).
    fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    /// Whether the remote description has been applied yet. Candidates
    /// arriving earlier must be buffered by the caller.
    fn has_remote_description(&self) -> bool;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Queues one message-oriented frame for the remote. Per-channel
    /// delivery is ordered and reliable; the call returns before the
    /// remote observes the frame.
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// Factory for [`Endpoint`]s, bound to one local peer.
pub trait Transport: Send + Sync {
    /// Creates an endpoint toward `remote`. Lifecycle events for the new
    /// channel are reported on `events`, tagged with `remote`.
    fn open(&self, remote: &PeerId, events: LinkEventSender) -> Box<dyn Endpoint>;
}

/// The already-established rendezvous link.
///
/// Frames received on it surface as [`LinkEvent::Message`] tagged with
/// the distinguished signal id.
pub trait SignalChannel: Send {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
    fn close(&mut self);
}
