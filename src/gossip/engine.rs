//! The active/passive exchange loop and the view calculus.
//!
//! The engine runs as its own task and owns the view outright; the rest
//! of the node only ever sees whole-value snapshots published as
//! `gossip:view-update` messages. Inbound gossip traffic reaches the
//! engine through a typed channel, so the view is never read and mutated
//! concurrently.

use rand::seq::{index, IndexedRandom};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::descriptor::{Descriptor, View};
use crate::config::{RpsConfig, SelectionPolicy};
use crate::message::{Message, MessageType, PeerId};
use crate::peer::PeerHandle;

/// Which side of an exchange a buffer is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeRole {
    /// The initiating side; reserves one buffer slot for its own
    /// descriptor.
    Active,
    /// The answering side.
    Passive,
}

/// Builds the buffer of descriptors sent to `distant` during an exchange.
///
/// Descriptors for the partner itself are never echoed back. With more
/// candidates than the target size, the youngest `|view| - H` descriptors
/// are preferred and the `H` oldest are drawn from only as a last resort.
/// The active side appends its own age-zero descriptor.
pub fn gen_buffer(
    role: ExchangeRole,
    distant: &PeerId,
    view: &View,
    own: &Descriptor,
    config: &RpsConfig,
) -> Vec<Descriptor> {
    let target = match role {
        ExchangeRole::Passive => config.view_size / 2,
        ExchangeRole::Active => (config.view_size / 2).saturating_sub(1),
    };

    let mut candidates: Vec<Descriptor> = view
        .iter()
        .filter(|descriptor| descriptor.id != *distant)
        .cloned()
        .collect();

    let mut buffer = if candidates.len() <= target {
        candidates
    } else {
        candidates.sort_by_key(|descriptor| descriptor.age);
        let head_len = candidates.len().saturating_sub(config.heal);
        let (head, tail) = candidates.split_at(head_len);

        let mut rng = rand::rng();
        if target < head.len() {
            head.choose_multiple(&mut rng, target).cloned().collect()
        } else {
            let mut buffer: Vec<Descriptor> = head.to_vec();
            buffer.extend(
                tail.choose_multiple(&mut rng, target - head.len())
                    .cloned(),
            );
            buffer
        }
    };

    if role == ExchangeRole::Active {
        buffer.push(own.fresh());
    }
    buffer
}

/// Merges a received buffer into the current view, then prunes back down
/// to `C`: freshly healed entries win over stale ones, then the oldest
/// descriptors go (up to `H`), then descriptors that were in the sent
/// buffer (up to `S`), then uniformly random ones.
pub fn merge_view(
    received: &[Descriptor],
    sent: &[Descriptor],
    view: &mut View,
    self_id: &PeerId,
    config: &RpsConfig,
) {
    for descriptor in received {
        if descriptor.id == *self_id {
            continue;
        }
        match view.position(&descriptor.id) {
            None => view.push(descriptor.clone()),
            Some(index) => {
                if descriptor.age < view.descriptors()[index].age {
                    view.replace(index, descriptor.clone());
                }
            }
        }
    }

    view.sort_by_age();

    let capacity = config.view_size;
    if view.len() > capacity {
        let to_drop = config.heal.min(view.len() - capacity);
        for _ in 0..to_drop {
            view.remove(view.len() - 1);
        }
    }

    if view.len() > capacity {
        let swappable: Vec<usize> = (0..view.len())
            .filter(|&position| {
                let id = &view.descriptors()[position].id;
                sent.iter().any(|descriptor| descriptor.id == *id)
            })
            .collect();
        let to_drop = config.swap.min(view.len() - capacity).min(swappable.len());
        if to_drop > 0 {
            let mut rng = rand::rng();
            let mut chosen: Vec<usize> = index::sample(&mut rng, swappable.len(), to_drop)
                .into_iter()
                .map(|sampled| swappable[sampled])
                .collect();
            chosen.sort_unstable_by(|a, b| b.cmp(a));
            for position in chosen {
                view.remove(position);
            }
        }
    }

    let mut rng = rand::rng();
    while view.len() > capacity {
        let victim = rng.random_range(0..view.len());
        view.remove(victim);
    }

    assert!(view.len() <= capacity, "view exceeds C after merge");
    debug_assert!(!view.contains(self_id), "own id present in view");
}

/// Picks the exchange partner for an active cycle.
pub fn select_remote(policy: SelectionPolicy, view: &View) -> Option<PeerId> {
    match policy {
        SelectionPolicy::Random => {
            let mut rng = rand::rng();
            view.descriptors()
                .choose(&mut rng)
                .map(|descriptor| descriptor.id.clone())
        }
        SelectionPolicy::Oldest => view.oldest().map(|descriptor| descriptor.id.clone()),
    }
}

struct PendingExchange {
    remote: PeerId,
    sent: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct DescriptorUpdate {
    path: Vec<String>,
    value: Value,
}

/// The random-peer-sampling task.
///
/// Spawned by the peer loop when the gossip extension is configured.
pub struct RpsEngine {
    config: RpsConfig,
    handle: PeerHandle,
    inbox: mpsc::UnboundedReceiver<Message>,
    view: View,
    descriptor: Descriptor,
    pending: Option<PendingExchange>,
}

impl RpsEngine {
    pub fn new(
        config: RpsConfig,
        handle: PeerHandle,
        inbox: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        let descriptor = Descriptor::new(handle.id().clone());
        Self {
            config,
            handle,
            inbox,
            view: View::new(),
            descriptor,
            pending: None,
        }
    }

    fn id(&self) -> &PeerId {
        self.handle.id()
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.gossip_period());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => self.active_cycle(),
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
            }
        }
        debug!(id = %self.id(), "gossip engine stopped");
    }

    fn handle_message(&mut self, message: Message) {
        match message.kind {
            MessageType::FirstView => self.on_first_view(&message),
            MessageType::GossipRequestExchange => self.passive_cycle(&message),
            MessageType::GossipAnswerExchange => self.on_answer(&message),
            MessageType::GossipDescriptorUpdate => self.on_descriptor_update(&message),
            _ => {}
        }
    }

    /// One tick of the active thread: any exchange still unanswered from
    /// the previous tick is silently abandoned, then a partner is picked
    /// and sent an active buffer.
    fn active_cycle(&mut self) {
        if let Some(abandoned) = self.pending.take() {
            debug!(remote = %abandoned.remote, "abandoning unanswered exchange");
        }
        if self.view.is_empty() {
            return;
        }
        let Some(remote) = select_remote(self.config.selection, &self.view) else {
            return;
        };

        let buffer = gen_buffer(
            ExchangeRole::Active,
            &remote,
            &self.view,
            &self.descriptor,
            &self.config,
        );
        let mut request = Message::new(
            MessageType::GossipRequestExchange,
            self.id().clone(),
            remote.clone(),
        );
        request.data = serde_json::to_value(&buffer).ok();
        self.handle.send(request);
        self.pending = Some(PendingExchange {
            remote,
            sent: buffer,
        });
    }

    /// The passive thread: answer with a passive buffer, then merge what
    /// the initiator sent.
    fn passive_cycle(&mut self, message: &Message) {
        let requester = message.from.clone();
        let received: Vec<Descriptor> = match message.typed_data() {
            Ok(received) => received,
            Err(error) => {
                warn!(%requester, %error, "exchange request without a buffer");
                return;
            }
        };

        let sent = gen_buffer(
            ExchangeRole::Passive,
            &requester,
            &self.view,
            &self.descriptor,
            &self.config,
        );
        let mut answer = Message::new(
            MessageType::GossipAnswerExchange,
            self.id().clone(),
            requester,
        );
        answer.data = serde_json::to_value(&sent).ok();
        self.handle.send(answer);

        self.merge_and_publish(&received, &sent);
    }

    fn on_answer(&mut self, message: &Message) {
        let Some(pending) = self.pending.take() else {
            debug!(from = %message.from, "answer with no exchange pending");
            return;
        };
        if pending.remote != message.from {
            debug!(from = %message.from, expected = %pending.remote, "answer from unexpected remote");
            self.pending = Some(pending);
            return;
        }

        let received: Vec<Descriptor> = match message.typed_data() {
            Ok(received) => received,
            Err(error) => {
                warn!(from = %message.from, %error, "exchange answer without a buffer");
                return;
            }
        };
        self.merge_and_publish(&received, &pending.sent);
    }

    /// Bootstrap view from the rendezvous service.
    fn on_first_view(&mut self, message: &Message) {
        let received: Vec<Descriptor> = match message.typed_data() {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "first-view without descriptors");
                return;
            }
        };
        debug!(count = received.len(), "installing bootstrap view");
        let self_id = self.handle.id().clone();
        merge_view(&received, &[], &mut self.view, &self_id, &self.config);
        self.publish_view();
    }

    /// The media layer publishes "parts I hold" through these updates.
    fn on_descriptor_update(&mut self, message: &Message) {
        let update: DescriptorUpdate = match message.typed_data() {
            Ok(update) => update,
            Err(error) => {
                warn!(%error, "descriptor update without path/value");
                return;
            }
        };
        self.descriptor.set_path(&update.path, update.value);
    }

    fn merge_and_publish(&mut self, received: &[Descriptor], sent: &[Descriptor]) {
        let self_id = self.handle.id().clone();
        merge_view(received, sent, &mut self.view, &self_id, &self.config);
        self.view.age_all();
        self.publish_view();
    }

    fn publish_view(&self) {
        let mut update = Message::new(
            MessageType::GossipViewUpdate,
            self.id().clone(),
            self.id().clone(),
        );
        update.data = serde_json::to_value(&self.view).ok();
        self.handle.dispatch_local(update);
    }
}
