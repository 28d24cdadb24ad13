//! Per-remote connection state machines and the connection registry.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use super::error::PeerError;
use crate::message::PeerId;
use crate::transport::{
    Endpoint, IceCandidate, SessionDescription, SignalChannel, TransportError,
};

/// State of one connection.
///
/// `Closed` is terminal: a closed connection is removed from the registry
/// and a fresh handshake builds a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// One negotiated (or in-negotiation) channel to a remote peer.
pub struct Connection {
    pub remote: PeerId,
    pub state: ConnectionState,
    /// Whether this side generated the offer.
    pub initiated: bool,
    pub opened_at: Option<Instant>,
    endpoint: Box<dyn Endpoint>,
}

impl Connection {
    pub fn new(remote: PeerId, endpoint: Box<dyn Endpoint>, initiated: bool) -> Self {
        Self {
            remote,
            state: ConnectionState::Connecting,
            initiated,
            opened_at: None,
            endpoint,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn has_remote_description(&self) -> bool {
        self.endpoint.has_remote_description()
    }

    pub fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.endpoint
            .create_offer()
            .map_err(|source| PeerError::Handshake {
                remote: self.remote.clone(),
                source,
            })
    }

    pub fn create_answer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.endpoint
            .create_answer(offer)
            .map_err(|source| PeerError::Handshake {
                remote: self.remote.clone(),
                source,
            })
    }

    pub fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.endpoint
            .set_remote_description(description)
            .map_err(|source| PeerError::Handshake {
                remote: self.remote.clone(),
                source,
            })
    }

    pub fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.endpoint
            .add_ice_candidate(candidate)
            .map_err(|source| PeerError::Handshake {
                remote: self.remote.clone(),
                source,
            })
    }

    /// Hands one serialized envelope to the channel.
    pub fn send_frame(&mut self, frame: Bytes) -> Result<(), PeerError> {
        if self.state != ConnectionState::Open {
            return Err(PeerError::UnknownTransport(self.remote.clone()));
        }
        self.endpoint.send(frame)?;
        Ok(())
    }

    pub fn mark_open(&mut self) {
        self.state = ConnectionState::Open;
        self.opened_at = Some(Instant::now());
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.endpoint.close();
    }
}

/// The connection registry: per-remote state machines, the distinguished
/// signaling link, and the pre-connection ICE buffer.
///
/// The buffer lives here rather than on a [`Connection`] because
/// candidates can arrive before the connection object exists; it is
/// drained as soon as the remote description is applied.
#[derive(Default)]
pub struct Links {
    connections: HashMap<PeerId, Connection>,
    signal: Option<Box<dyn SignalChannel>>,
    ice_buffer: HashMap<PeerId, Vec<IceCandidate>>,
}

impl Links {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, remote: &PeerId) -> Option<&Connection> {
        self.connections.get(remote)
    }

    pub fn get_mut(&mut self, remote: &PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(remote)
    }

    /// Inserts a connection, returning the replaced one if any.
    pub fn insert(&mut self, connection: Connection) -> Option<Connection> {
        self.connections
            .insert(connection.remote.clone(), connection)
    }

    pub fn remove(&mut self, remote: &PeerId) -> Option<Connection> {
        self.ice_buffer.remove(remote);
        self.connections.remove(remote)
    }

    /// Whether a connection to `remote` exists and is not closed.
    pub fn is_live(&self, remote: &PeerId) -> bool {
        self.connections
            .get(remote)
            .is_some_and(|connection| connection.state != ConnectionState::Closed)
    }

    pub fn is_open(&self, remote: &PeerId) -> bool {
        self.connections
            .get(remote)
            .is_some_and(Connection::is_open)
    }

    /// Remote ids of every open connection. The signaling link is not a
    /// connection and never appears here.
    pub fn open_remotes(&self) -> Vec<PeerId> {
        self.connections
            .values()
            .filter(|connection| connection.is_open())
            .map(|connection| connection.remote.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn open_count(&self) -> usize {
        self.connections
            .values()
            .filter(|connection| connection.is_open())
            .count()
    }

    /// Buffers a candidate that arrived before the remote description.
    pub fn buffer_candidate(&mut self, remote: &PeerId, candidate: IceCandidate) {
        debug!(%remote, "buffering early ice candidate");
        self.ice_buffer
            .entry(remote.clone())
            .or_default()
            .push(candidate);
    }

    /// Removes and returns the buffered candidates for `remote`.
    pub fn drain_candidates(&mut self, remote: &PeerId) -> Vec<IceCandidate> {
        self.ice_buffer.remove(remote).unwrap_or_default()
    }

    pub fn buffered_candidate_count(&self, remote: &PeerId) -> usize {
        self.ice_buffer
            .get(remote)
            .map(|candidates| candidates.len())
            .unwrap_or(0)
    }

    pub fn set_signal(&mut self, signal: Box<dyn SignalChannel>) {
        self.signal = Some(signal);
    }

    pub fn has_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// Hands one frame to the signaling link.
    pub fn send_signal_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match self.signal.as_mut() {
            Some(signal) => signal.send(frame),
            None => Err(TransportError::Closed),
        }
    }

    pub fn close_all(&mut self) {
        for connection in self.connections.values_mut() {
            connection.close();
        }
        self.connections.clear();
        self.ice_buffer.clear();
        if let Some(mut signal) = self.signal.take() {
            signal.close();
        }
    }
}
