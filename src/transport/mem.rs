//! In-memory transport used by the crate's own tests.
//!
//! [`MemNetwork`] plays the role of the underlying fabric: endpoints for
//! the same unordered peer pair rendezvous inside the shared state, go
//! live once both sides have applied a remote description, and exchange
//! frames over the per-peer event channels (per-pair FIFO, as the real
//! transport guarantees). Descriptions and candidates are synthetic blobs;
//! candidates are validated but carry no connectivity meaning.
//!
//! [`MemSignalHub`] is the matching rendezvous service: every frame sent
//! by one registered peer is delivered to all the others.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Endpoint, IceCandidate, LinkEvent, LinkEventSender, SdpKind, SessionDescription,
    SignalChannel, Transport, TransportError,
};
use crate::message::PeerId;

type PairKey = (PeerId, PeerId);

fn pair_key(a: &PeerId, b: &PeerId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct Side {
    generation: u64,
    events: LinkEventSender,
    has_remote_description: bool,
}

#[derive(Default)]
struct PairState {
    sides: HashMap<PeerId, Side>,
    live: bool,
}

#[derive(Default)]
struct NetState {
    pairs: HashMap<PairKey, PairState>,
    next_generation: u64,
}

/// A shared in-memory fabric connecting any number of [`MemTransport`]s.
#[derive(Clone, Default)]
pub struct MemNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transport bound to one local peer id.
    pub fn transport(&self, local: impl Into<PeerId>) -> MemTransport {
        MemTransport {
            local: local.into(),
            state: Arc::clone(&self.state),
        }
    }
}

/// The per-peer [`Transport`] implementation over a [`MemNetwork`].
pub struct MemTransport {
    local: PeerId,
    state: Arc<Mutex<NetState>>,
}

impl Transport for MemTransport {
    fn open(&self, remote: &PeerId, events: LinkEventSender) -> Box<dyn Endpoint> {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let key = pair_key(&self.local, remote);
        let pair = state.pairs.entry(key).or_default();
        pair.sides.insert(
            self.local.clone(),
            Side {
                generation,
                events: events.clone(),
                has_remote_description: false,
            },
        );
        // A replaced side invalidates any earlier liveness.
        pair.live = false;

        Box::new(MemEndpoint {
            local: self.local.clone(),
            remote: remote.clone(),
            generation,
            events,
            state: Arc::clone(&self.state),
            has_local_description: false,
            has_remote_description: false,
            closed: false,
        })
    }
}

pub struct MemEndpoint {
    local: PeerId,
    remote: PeerId,
    generation: u64,
    events: LinkEventSender,
    state: Arc<Mutex<NetState>>,
    has_local_description: bool,
    has_remote_description: bool,
    closed: bool,
}

impl MemEndpoint {
    fn mark_remote_description(&mut self) {
        self.has_remote_description = true;
        let mut state = self.state.lock();
        let key = pair_key(&self.local, &self.remote);
        let Some(pair) = state.pairs.get_mut(&key) else {
            return;
        };
        if let Some(side) = pair.sides.get_mut(&self.local) {
            if side.generation == self.generation {
                side.has_remote_description = true;
            }
        }

        // Both remote descriptions applied: the channel opens on each side.
        let negotiated = pair.sides.len() == 2
            && pair.sides.values().all(|side| side.has_remote_description);
        if negotiated && !pair.live {
            pair.live = true;
            let ids: Vec<PeerId> = pair.sides.keys().cloned().collect();
            for id in ids {
                let other = if id == key.0 { key.1.clone() } else { key.0.clone() };
                if let Some(side) = pair.sides.get(&id) {
                    let _ = side.events.send((other, LinkEvent::Open));
                }
            }
        }
    }

    fn emit_own_candidate(&self) {
        let candidate = IceCandidate {
            blob: format!("cand:{}#{}", self.local, self.generation),
        };
        let _ = self
            .events
            .send((self.remote.clone(), LinkEvent::Candidate(candidate)));
    }
}

impl Endpoint for MemEndpoint {
    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.has_local_description = true;
        self.emit_own_candidate();
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            blob: format!("sdp:{}->{}#{}", self.local, self.remote, self.generation),
        })
    }

    fn create_answer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if offer.kind != SdpKind::Offer {
            return Err(TransportError::Negotiation("expected an offer".to_string()));
        }
        self.mark_remote_description();
        self.has_local_description = true;
        self.emit_own_candidate();
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            blob: format!("sdp:{}->{}#{}", self.local, self.remote, self.generation),
        })
    }

    fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if !self.has_local_description {
            return Err(TransportError::Negotiation(
                "no local description".to_string(),
            ));
        }
        if description.kind != SdpKind::Answer {
            return Err(TransportError::Negotiation(
                "expected an answer".to_string(),
            ));
        }
        self.mark_remote_description();
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    fn add_ice_candidate(&mut self, _candidate: &IceCandidate) -> Result<(), TransportError> {
        if !self.has_remote_description {
            return Err(TransportError::NoRemoteDescription);
        }
        Ok(())
    }

    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let state = self.state.lock();
        let key = pair_key(&self.local, &self.remote);
        let pair = state.pairs.get(&key).ok_or(TransportError::Closed)?;
        if !pair.live {
            return Err(TransportError::Closed);
        }
        let side = pair.sides.get(&self.remote).ok_or(TransportError::Closed)?;
        side.events
            .send((self.local.clone(), LinkEvent::Message(frame)))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.state.lock();
        let key = pair_key(&self.local, &self.remote);
        let Some(pair) = state.pairs.get_mut(&key) else {
            return;
        };
        let ours = pair
            .sides
            .get(&self.local)
            .is_some_and(|side| side.generation == self.generation);
        if !ours {
            // A newer endpoint replaced this side; nothing to tear down.
            return;
        }
        pair.sides.remove(&self.local);
        let was_live = pair.live;
        pair.live = false;
        if was_live {
            if let Some(side) = pair.sides.get(&self.remote) {
                let _ = side
                    .events
                    .send((self.local.clone(), LinkEvent::Closed));
            }
        }
        if pair.sides.is_empty() {
            state.pairs.remove(&key);
        }
        debug!(local = %self.local, remote = %self.remote, "mem endpoint closed");
    }
}

impl Drop for MemEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// An in-memory rendezvous service.
#[derive(Clone, Default)]
pub struct MemSignalHub {
    registry: Arc<Mutex<HashMap<PeerId, LinkEventSender>>>,
}

impl MemSignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer and returns its end of the signaling link. Frames
    /// it sends are delivered to every other registered peer.
    pub fn register(&self, id: &PeerId, events: LinkEventSender) -> Box<dyn SignalChannel> {
        self.registry.lock().insert(id.clone(), events);
        Box::new(MemSignalLink {
            id: id.clone(),
            registry: Arc::clone(&self.registry),
        })
    }

    /// Delivers one raw frame to a single peer, as the rendezvous service
    /// would. Useful for injecting bootstrap traffic in tests.
    pub fn deliver(&self, to: &PeerId, frame: Bytes) {
        if let Some(events) = self.registry.lock().get(to) {
            let _ = events.send((PeerId::signal(), LinkEvent::Message(frame)));
        }
    }
}

struct MemSignalLink {
    id: PeerId,
    registry: Arc<Mutex<HashMap<PeerId, LinkEventSender>>>,
}

impl SignalChannel for MemSignalLink {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let registry = self.registry.lock();
        if !registry.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        for (id, events) in registry.iter() {
            if *id != self.id {
                let _ = events.send((PeerId::signal(), LinkEvent::Message(frame.clone())));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_endpoints_open_after_negotiation() {
        let net = MemNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let a = PeerId::new("a");
        let b = PeerId::new("b");

        let mut responder = net.transport("b").open(&a, b_tx);
        let mut requester = net.transport("a").open(&b, a_tx);

        let offer = responder.create_offer().unwrap();
        let answer = requester.create_answer(&offer).unwrap();
        responder.set_remote_description(&answer).unwrap();

        // Candidate events precede Open on the offering side.
        assert!(matches!(
            b_rx.try_recv().unwrap().1,
            LinkEvent::Candidate(_)
        ));
        assert!(matches!(b_rx.try_recv().unwrap().1, LinkEvent::Open));
        assert!(matches!(
            a_rx.try_recv().unwrap().1,
            LinkEvent::Candidate(_)
        ));
        assert!(matches!(a_rx.try_recv().unwrap().1, LinkEvent::Open));

        requester.send(Bytes::from_static(b"hello")).unwrap();
        match b_rx.try_recv().unwrap() {
            (from, LinkEvent::Message(frame)) => {
                assert_eq!(from, a);
                assert_eq!(frame, Bytes::from_static(b"hello"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_candidate_requires_remote_description() {
        let net = MemNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut endpoint = net.transport("a").open(&PeerId::new("b"), tx);

        let candidate = IceCandidate {
            blob: "cand:x".to_string(),
        };
        assert!(matches!(
            endpoint.add_ice_candidate(&candidate),
            Err(TransportError::NoRemoteDescription)
        ));
    }

    #[test]
    fn test_close_notifies_counterpart() {
        let net = MemNetwork::new();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let mut responder = net.transport("b").open(&PeerId::new("a"), b_tx);
        let mut requester = net.transport("a").open(&PeerId::new("b"), a_tx);

        let offer = responder.create_offer().unwrap();
        let answer = requester.create_answer(&offer).unwrap();
        responder.set_remote_description(&answer).unwrap();

        requester.close();

        let mut saw_closed = false;
        while let Ok((_, event)) = b_rx.try_recv() {
            if matches!(event, LinkEvent::Closed) {
                saw_closed = true;
            }
        }
        assert!(saw_closed);
        assert!(responder.send(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_signal_hub_fans_out_to_others() {
        let hub = MemSignalHub::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        let mut a_link = hub.register(&PeerId::new("a"), a_tx);
        let _b_link = hub.register(&PeerId::new("b"), b_tx);

        a_link.send(Bytes::from_static(b"frame")).unwrap();

        assert!(a_rx.try_recv().is_err());
        match b_rx.try_recv().unwrap() {
            (from, LinkEvent::Message(frame)) => {
                assert!(from.is_signal());
                assert_eq!(frame, Bytes::from_static(b"frame"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
