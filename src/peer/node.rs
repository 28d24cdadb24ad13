//! The mesh-node event loop.
//!
//! A [`Peer`] exclusively owns its connection registry, ICE buffer and
//! retry queue and serializes every state change through one task, so no
//! locking is needed. External code talks to it through a [`PeerHandle`];
//! transports report channel lifecycle through the link-event channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionState, Links};
use super::retry::{DeliveryStatus, RetryQueue};
use crate::bus::MessageBus;
use crate::config::{Config, ExtensionConfig};
use crate::gossip::RpsEngine;
use crate::media::MediaFetcher;
use crate::message::{Message, MessageType, PeerId};
use crate::origin::{OriginClient, OriginFetch};
use crate::transport::{
    IceCandidate, LinkEvent, LinkEventSender, SessionDescription, SignalChannel, Transport,
};

enum Command {
    Send {
        message: Message,
        timeout: Option<Duration>,
        notify: Option<oneshot::Sender<DeliveryStatus>>,
    },
    DispatchLocal(Message),
    Stats(oneshot::Sender<PeerStats>),
    Shutdown,
}

/// Point-in-time counters, mostly useful for tests and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub connections: usize,
    pub open_connections: usize,
    pub queued_messages: usize,
}

/// Clonable handle to a running (or soon-to-run) [`Peer`].
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<MessageBus>,
}

impl PeerHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Hands a message to the routing rule chain.
    pub fn send(&self, message: Message) {
        let _ = self.commands.send(Command::Send {
            message,
            timeout: None,
            notify: None,
        });
    }

    /// Like [`PeerHandle::send`], but with a per-entry timeout should the
    /// message end up queued. The returned channel reports the
    /// delivered-or-timed-out outcome exactly once.
    pub fn send_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> oneshot::Receiver<DeliveryStatus> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Send {
            message,
            timeout: Some(timeout),
            notify: Some(tx),
        });
        rx
    }

    /// Dispatches a message locally, skipping the transport entirely.
    pub fn dispatch_local(&self, message: Message) {
        let _ = self.commands.send(Command::DispatchLocal(message));
    }

    pub async fn stats(&self) -> Option<PeerStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Stats(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Assembles a [`Peer`] and its extensions.
pub struct PeerBuilder {
    id: PeerId,
    config: Config,
    transport: Arc<dyn Transport>,
    origin: Option<Arc<dyn OriginFetch>>,
    signal: Option<Box<dyn SignalChannel>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    link_events_tx: LinkEventSender,
    link_events_rx: mpsc::UnboundedReceiver<(PeerId, LinkEvent)>,
    bus: Arc<MessageBus>,
}

impl PeerBuilder {
    pub fn new(id: impl Into<PeerId>, transport: Arc<dyn Transport>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        Self {
            id: id.into(),
            config: Config::default(),
            transport,
            origin: None,
            signal: None,
            commands_tx,
            commands_rx,
            link_events_tx,
            link_events_rx,
            bus: Arc::new(MessageBus::new()),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn origin(mut self, origin: Arc<dyn OriginFetch>) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn signal(mut self, signal: Box<dyn SignalChannel>) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Sender on which transports (and the signaling link) report events.
    /// Needed before [`PeerBuilder::build`] when registering with an
    /// external rendezvous.
    pub fn link_events(&self) -> LinkEventSender {
        self.link_events_tx.clone()
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id.clone(),
            commands: self.commands_tx.clone(),
            bus: Arc::clone(&self.bus),
        }
    }

    pub fn build(self) -> Peer {
        let handle = self.handle();
        let mut links = Links::new();
        if let Some(signal) = self.signal {
            links.set_signal(signal);
        }

        let mut gossip_tx = None;
        let mut gossip_engine = None;
        let mut media = None;

        for extension in &self.config.extensions {
            match extension {
                ExtensionConfig::Gossip(rps) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    gossip_engine = Some(RpsEngine::new(rps.clone(), handle.clone(), rx));
                    gossip_tx = Some(tx);
                }
                ExtensionConfig::Media(config) => {
                    let origin: Arc<dyn OriginFetch> = match &self.origin {
                        Some(origin) => Arc::clone(origin),
                        None => match OriginClient::new() {
                            Ok(client) => Arc::new(client),
                            Err(error) => {
                                warn!(%error, "origin client unavailable; media extension disabled");
                                continue;
                            }
                        },
                    };
                    let fetcher = MediaFetcher::new(config.clone(), handle.clone(), origin);
                    fetcher.register(&self.bus);
                    media = Some(fetcher);
                }
            }
        }

        Peer {
            id: self.id,
            max_ttl: self.config.peer.ttl,
            queue_period: self.config.peer.queue_timeout(),
            bus: self.bus,
            links,
            retry: RetryQueue::new(),
            transport: self.transport,
            commands_tx: self.commands_tx,
            commands_rx: self.commands_rx,
            link_events_tx: self.link_events_tx,
            link_events_rx: self.link_events_rx,
            gossip_tx,
            gossip_engine,
            media,
        }
    }
}

/// The mesh node.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use swarmcast::peer::Peer;
/// use swarmcast::transport::mem::MemNetwork;
///
/// # async fn example() {
/// let net = MemNetwork::new();
/// let peer = Peer::builder("a", Arc::new(net.transport("a"))).build();
/// let handle = peer.handle();
/// tokio::spawn(peer.run());
/// # }
/// ```
pub struct Peer {
    id: PeerId,
    max_ttl: u32,
    queue_period: Duration,
    bus: Arc<MessageBus>,
    links: Links,
    retry: RetryQueue,
    transport: Arc<dyn Transport>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    link_events_tx: LinkEventSender,
    link_events_rx: mpsc::UnboundedReceiver<(PeerId, LinkEvent)>,
    gossip_tx: Option<mpsc::UnboundedSender<Message>>,
    gossip_engine: Option<RpsEngine>,
    media: Option<Arc<MediaFetcher>>,
}

impl Peer {
    pub fn builder(id: impl Into<PeerId>, transport: Arc<dyn Transport>) -> PeerBuilder {
        PeerBuilder::new(id, transport)
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id.clone(),
            commands: self.commands_tx.clone(),
            bus: Arc::clone(&self.bus),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The media fetcher, when the media extension is configured.
    pub fn media(&self) -> Option<&Arc<MediaFetcher>> {
        self.media.as_ref()
    }

    /// Runs the event loop until shutdown. Spawns the gossip engine task
    /// when the gossip extension is configured.
    pub async fn run(mut self) {
        if let Some(engine) = self.gossip_engine.take() {
            tokio::spawn(engine.run());
        }

        let mut retry_tick = tokio::time::interval(self.queue_period);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        retry_tick.tick().await;

        info!(id = %self.id, "peer loop started");
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    Some(Command::Send { message, timeout, notify }) => {
                        self.send_message(message, timeout, notify);
                    }
                    Some(Command::DispatchLocal(message)) => self.deliver_local(message),
                    Some(Command::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = self.link_events_rx.recv() => {
                    if let Some((remote, event)) = event {
                        self.handle_link_event(remote, event);
                    }
                }
                _ = retry_tick.tick() => self.tick_retry_queue(),
            }
        }

        self.links.close_all();
        info!(id = %self.id, "peer loop stopped");
    }

    fn stats(&self) -> PeerStats {
        PeerStats {
            connections: self.links.connection_count(),
            open_connections: self.links.open_count(),
            queued_messages: self.retry.len(),
        }
    }

    /// The routing rule chain. The first matching rule wins:
    ///
    /// 1. destination is this peer - dispatch locally;
    /// 2. an open connection to the destination exists - use it;
    /// 3. the message carries a route whose next hop is connected - pop
    ///    the hop and relay;
    /// 4. the type is forwardable - broadcast;
    /// 5. otherwise - park in the retry queue and request a connection.
    fn send_message(
        &mut self,
        mut message: Message,
        timeout: Option<Duration>,
        notify: Option<oneshot::Sender<DeliveryStatus>>,
    ) {
        if message.to == self.id {
            if let Some(notify) = notify {
                let _ = notify.send(DeliveryStatus::Delivered);
            }
            self.deliver_local(message);
        } else if self.links.is_open(&message.to) {
            let to = message.to.clone();
            self.transmit(&to, &message);
            if let Some(notify) = notify {
                let _ = notify.send(DeliveryStatus::Delivered);
            }
        } else if let Some(next_hop) = self.route_next_hop(&mut message) {
            self.transmit(&next_hop, &message);
            if let Some(notify) = notify {
                let _ = notify.send(DeliveryStatus::Delivered);
            }
        } else if message.kind.is_forwardable() {
            self.broadcast_message(message);
            if let Some(notify) = notify {
                let _ = notify.send(DeliveryStatus::Delivered);
            }
        } else {
            debug!(to = %message.to, kind = %message.kind, "no open connection; queueing");
            let target = message.to.clone();
            self.retry.push(message, timeout, notify);

            let mut request =
                Message::new(MessageType::RequestPeer, self.id.clone(), target);
            request.ttl = Some(self.max_ttl);
            self.send_message(request, None, None);
        }
    }

    /// Pops the route's tail hop when it is locally connected.
    fn route_next_hop(&self, message: &mut Message) -> Option<PeerId> {
        let route = message.route.as_mut()?;
        let next = route.last()?;
        if !self.links.is_open(next) {
            return None;
        }
        let hop = route.pop();
        if route.is_empty() {
            message.route = None;
        }
        hop
    }

    /// Forwards to every open connection not yet involved with the
    /// message. With no eligible target the message falls back to the
    /// signaling link, TTL zeroed so the rendezvous tier cannot
    /// re-propagate it.
    fn broadcast_message(&mut self, message: Message) {
        let targets: Vec<PeerId> = self
            .links
            .open_remotes()
            .into_iter()
            .filter(|remote| *remote != self.id && !message.handled_by(remote))
            .collect();

        if targets.is_empty() {
            if self.links.has_signal() {
                let mut fallback = message;
                fallback.ttl = Some(0);
                match fallback.encode() {
                    Ok(frame) => {
                        if let Err(error) = self.links.send_signal_frame(frame) {
                            warn!(%error, "signaling fallback failed");
                        }
                    }
                    Err(error) => warn!(%error, "broadcast encode failed"),
                }
            } else {
                debug!(kind = %message.kind, "broadcast with no targets; dropping");
            }
            return;
        }

        for remote in targets {
            self.transmit(&remote, &message);
        }
    }

    fn transmit(&mut self, remote: &PeerId, message: &Message) -> bool {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%remote, %error, "message encode failed");
                return false;
            }
        };
        match self.links.get_mut(remote) {
            Some(connection) => match connection.send_frame(frame) {
                Ok(()) => true,
                Err(error) => {
                    warn!(%remote, %error, "send failed");
                    false
                }
            },
            None => {
                warn!(%remote, "send to unknown transport");
                false
            }
        }
    }

    fn handle_link_event(&mut self, remote: PeerId, event: LinkEvent) {
        match event {
            LinkEvent::Open => self.on_channel_open(remote),
            LinkEvent::Message(frame) => self.on_frame(remote, frame),
            LinkEvent::Candidate(candidate) => self.on_local_candidate(remote, candidate),
            LinkEvent::Closed => self.on_channel_closed(remote),
            LinkEvent::Error(error) => {
                warn!(%remote, error, "transport error; tearing down connection");
                self.on_channel_closed(remote);
            }
        }
    }

    fn on_channel_open(&mut self, remote: PeerId) {
        match self.links.get_mut(&remote) {
            Some(connection) => connection.mark_open(),
            None => {
                debug!(%remote, "open event for unknown connection");
                return;
            }
        }
        info!(%remote, "channel open");

        // Queued messages for this remote leave immediately, oldest first.
        for entry in self.retry.take_for(&remote) {
            let message = entry.resolve(DeliveryStatus::Delivered);
            self.transmit(&remote, &message);
        }

        let event = Message::new(MessageType::Connected, remote, self.id.clone());
        self.deliver_local(event);
    }

    fn on_channel_closed(&mut self, remote: PeerId) {
        if let Some(mut connection) = self.links.remove(&remote) {
            let was_open = connection.is_open();
            connection.close();
            debug!(%remote, "connection closed");
            if was_open {
                let event = Message::new(MessageType::Disconnected, remote, self.id.clone());
                self.deliver_local(event);
            }
        }
    }

    /// A locally gathered candidate is relayed to the remote end through
    /// whatever path currently reaches it.
    fn on_local_candidate(&mut self, remote: PeerId, candidate: IceCandidate) {
        let mut message = Message::new(MessageType::IceCandidate, self.id.clone(), remote);
        message.ttl = Some(self.max_ttl);
        message.data = serde_json::to_value(&candidate).ok();
        self.send_message(message, None, None);
    }

    fn on_frame(&mut self, link: PeerId, frame: Bytes) {
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(%link, %error, "dropping undecodable frame");
                return;
            }
        };
        if let Err(error) = message.validate() {
            warn!(%link, %error, "dropping malformed message");
            return;
        }

        if link.is_signal() {
            // The rendezvous echoes our own broadcasts back.
            if message.from == self.id {
                return;
            }
            // Replayed stale broadcasts come from peers older (smaller)
            // than this one; only younger requesters are honored.
            if message.kind == MessageType::RequestPeer && message.from < self.id {
                debug!(from = %message.from, "discarding stale request-peer from signaling");
                return;
            }
        }

        if message.to == self.id || message.to.is_broadcast() {
            self.deliver_local(message);
        } else {
            self.forward_message(message);
        }
    }

    /// Relays a message addressed to another peer: TTL down, forward
    /// history extended, back into the rule chain.
    fn forward_message(&mut self, mut message: Message) {
        if !message.kind.is_forwardable() {
            debug!(kind = %message.kind, to = %message.to, "not forwardable; dropping");
            return;
        }
        if message.handled_by(&self.id) {
            return;
        }
        let ttl = message.ttl.unwrap_or(0);
        if ttl == 0 {
            debug!(kind = %message.kind, to = %message.to, "ttl exhausted; dropping");
            return;
        }
        message.ttl = Some(ttl - 1);
        message.forward_by.push(self.id.clone());
        self.send_message(message, None, None);
    }

    /// Dispatches a message to this node: connection handling first, then
    /// the gossip engine, then every bus listener.
    fn deliver_local(&mut self, message: Message) {
        if let Err(error) = message.validate() {
            warn!(%error, "dropping malformed local message");
            return;
        }

        match &message.kind {
            MessageType::RequestPeer => self.on_request_peer(&message),
            MessageType::Offer => self.on_offer(&message),
            MessageType::Answer => self.on_answer(&message),
            MessageType::IceCandidate => self.on_remote_candidate(&message),
            kind if kind.is_gossip() && *kind != MessageType::GossipViewUpdate => {
                if let Some(gossip) = &self.gossip_tx {
                    let _ = gossip.send(message.clone());
                }
            }
            _ => {}
        }

        self.bus.dispatch(&message);
    }

    /// A peer request from a remote we are not connected to is answered
    /// with an offer, routed back along the request's forward history.
    fn on_request_peer(&mut self, message: &Message) {
        let requester = message.from.clone();
        if requester == self.id {
            return;
        }
        if self.links.is_live(&requester) {
            debug!(%requester, "request-peer from live remote ignored");
            return;
        }
        self.respond_with_offer(requester, message.forward_by.clone());
    }

    fn respond_with_offer(&mut self, requester: PeerId, route: Vec<PeerId>) {
        let endpoint = self
            .transport
            .open(&requester, self.link_events_tx.clone());
        let mut connection = Connection::new(requester.clone(), endpoint, true);
        let offer = match connection.create_offer() {
            Ok(offer) => offer,
            Err(error) => {
                warn!(%requester, %error, "offer creation failed");
                return;
            }
        };
        self.links.insert(connection);

        let mut reply = Message::new(MessageType::Offer, self.id.clone(), requester);
        reply.ttl = Some(self.max_ttl);
        reply.data = serde_json::to_value(&offer).ok();
        if !route.is_empty() {
            reply.route = Some(route);
        }
        self.send_message(reply, None, None);
    }

    fn on_offer(&mut self, message: &Message) {
        let responder = message.from.clone();
        let offer: SessionDescription = match message.typed_data() {
            Ok(offer) => offer,
            Err(error) => {
                warn!(%responder, %error, "offer without a session description");
                return;
            }
        };

        if let Some(existing) = self.links.get(&responder) {
            let simultaneous = existing.initiated
                && existing.state == ConnectionState::Connecting
                && !existing.has_remote_description();
            if simultaneous && self.id < responder {
                // Both sides offered at once; the smaller id yields its
                // own offer and answers the other instead.
                debug!(%responder, "simultaneous open; yielding own offer");
                if let Some(mut stale) = self.links.remove(&responder) {
                    stale.close();
                }
            } else {
                debug!(%responder, "offer for existing connection ignored");
                return;
            }
        }

        let endpoint = self
            .transport
            .open(&responder, self.link_events_tx.clone());
        let mut connection = Connection::new(responder.clone(), endpoint, false);
        let answer = match connection.create_answer(&offer) {
            Ok(answer) => answer,
            Err(error) => {
                warn!(%responder, %error, "answer creation failed");
                return;
            }
        };
        // The remote description is now applied; flush early candidates.
        for candidate in self.links.drain_candidates(&responder) {
            if let Err(error) = connection.add_ice_candidate(&candidate) {
                warn!(%responder, %error, "buffered candidate rejected");
            }
        }
        self.links.insert(connection);

        let mut reply = Message::new(MessageType::Answer, self.id.clone(), responder);
        reply.ttl = Some(self.max_ttl);
        reply.data = serde_json::to_value(&answer).ok();
        let route = message.forward_by.clone();
        if !route.is_empty() {
            reply.route = Some(route);
        }
        self.send_message(reply, None, None);
    }

    fn on_answer(&mut self, message: &Message) {
        let remote = message.from.clone();
        let answer: SessionDescription = match message.typed_data() {
            Ok(answer) => answer,
            Err(error) => {
                warn!(%remote, %error, "answer without a session description");
                return;
            }
        };

        let applied = match self.links.get_mut(&remote) {
            Some(connection) => {
                if !connection.initiated || connection.has_remote_description() {
                    debug!(%remote, "unexpected answer ignored");
                    return;
                }
                connection.set_remote_description(&answer)
            }
            None => {
                debug!(%remote, "answer for unknown connection");
                return;
            }
        };

        if let Err(error) = applied {
            warn!(%remote, %error, "handshake failure");
            if let Some(mut failed) = self.links.remove(&remote) {
                failed.close();
            }
            return;
        }

        let candidates = self.links.drain_candidates(&remote);
        if let Some(connection) = self.links.get_mut(&remote) {
            for candidate in candidates {
                if let Err(error) = connection.add_ice_candidate(&candidate) {
                    warn!(%remote, %error, "buffered candidate rejected");
                }
            }
        }
    }

    fn on_remote_candidate(&mut self, message: &Message) {
        let remote = message.from.clone();
        let candidate: IceCandidate = match message.typed_data() {
            Ok(candidate) => candidate,
            Err(error) => {
                warn!(%remote, %error, "icecandidate without a candidate");
                return;
            }
        };

        let ready = self
            .links
            .get(&remote)
            .is_some_and(|connection| connection.has_remote_description());
        if ready {
            if let Some(connection) = self.links.get_mut(&remote) {
                if let Err(error) = connection.add_ice_candidate(&candidate) {
                    warn!(%remote, %error, "candidate rejected");
                }
            }
        } else {
            self.links.buffer_candidate(&remote, candidate);
        }
    }

    /// Fixed-period queue maintenance: deliverable entries leave first,
    /// then expired entries fire their timeout notification and drop.
    fn tick_retry_queue(&mut self) {
        let links = &self.links;
        let deliverable = self.retry.take_deliverable(|to| links.is_open(to));
        for entry in deliverable {
            let remote = entry.message.to.clone();
            let message = entry.resolve(DeliveryStatus::Delivered);
            self.transmit(&remote, &message);
        }

        let now = tokio::time::Instant::now();
        for entry in self.retry.take_expired(now) {
            debug!(to = %entry.message.to, kind = %entry.message.kind, "queued message timed out");
            entry.resolve(DeliveryStatus::TimedOut);
        }
    }
}
