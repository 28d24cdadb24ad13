//! In-process publish/subscribe keyed by message type.
//!
//! The bus glues the subsystems together: the mesh node dispatches every
//! locally-delivered message here, and the media fetcher, tests and
//! one-shot waiters subscribe by [`MessageType`]. Dispatch order within a
//! type is registration order, so test runs are reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::message::{Message, MessageType};

type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Token returned by [`MessageBus::on`] and [`MessageBus::once`], used to
/// remove a listener. Registering the same closure twice yields distinct
/// tokens and distinct registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

/// A typed publish/subscribe dispatcher.
///
/// # Examples
///
/// ```
/// use swarmcast::bus::MessageBus;
/// use swarmcast::message::{Message, MessageType, PeerId};
///
/// let bus = MessageBus::new();
/// bus.on(MessageType::Connected, |message| {
///     println!("connected to {}", message.from);
/// });
///
/// let event = Message::new(MessageType::Connected, PeerId::new("b"), PeerId::new("a"));
/// assert!(bus.dispatch(&event));
/// ```
#[derive(Default)]
pub struct MessageBus {
    listeners: Mutex<HashMap<MessageType, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for every dispatch of `kind`.
    pub fn on<F>(&self, kind: MessageType, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(listener))
    }

    /// Registers a listener removed after its first invocation.
    pub fn once<F>(&self, kind: MessageType, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(listener))
    }

    fn register(&self, kind: MessageType, once: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push(Entry { id, once, listener });
        id
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, kind: &MessageType, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(kind) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|entry| entry.id != id);
                before != entries.len()
            }
            None => false,
        }
    }

    /// Removes every listener for `kind`, or every listener of every type
    /// when `kind` is `None`.
    pub fn remove_all_listeners(&self, kind: Option<&MessageType>) {
        let mut listeners = self.listeners.lock();
        match kind {
            Some(kind) => {
                listeners.remove(kind);
            }
            None => listeners.clear(),
        }
    }

    /// Number of listeners currently registered for `kind`.
    pub fn listener_count(&self, kind: &MessageType) -> usize {
        self.listeners
            .lock()
            .get(kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Dispatches a message to every listener registered for its type, in
    /// registration order. One-shot listeners are removed first so a
    /// listener re-registering itself does not observe the same message
    /// twice.
    ///
    /// Malformed messages are dropped and logged; returns `false` for a
    /// dropped message.
    pub fn dispatch(&self, message: &Message) -> bool {
        if let Err(error) = message.validate() {
            warn!(kind = %message.kind, %error, "dropping malformed message");
            return false;
        }

        let snapshot: Vec<Listener> = {
            let mut listeners = self.listeners.lock();
            match listeners.get_mut(&message.kind) {
                Some(entries) => {
                    let snapshot = entries
                        .iter()
                        .map(|entry| Arc::clone(&entry.listener))
                        .collect();
                    entries.retain(|entry| !entry.once);
                    snapshot
                }
                None => Vec::new(),
            }
        };

        for listener in snapshot {
            listener(message);
        }
        true
    }
}
