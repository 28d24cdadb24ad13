//! The retry queue for messages that cannot yet be delivered.
//!
//! A message whose destination has no open connection is parked here while
//! the node requests one. Each entry can carry a per-entry timeout and a
//! one-shot notification channel: the oneshot guarantees structurally that
//! the delivered-or-timed-out outcome is reported exactly once.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::message::{Message, PeerId};

/// Outcome of a queued send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The destination connected and the message was handed to it.
    Delivered,
    /// The per-entry timeout elapsed first; the entry was dropped.
    TimedOut,
}

/// One parked message.
pub struct RetryEntry {
    pub message: Message,
    pub timeout: Option<Duration>,
    pub notify: Option<oneshot::Sender<DeliveryStatus>>,
    pub enqueued_at: Instant,
}

impl RetryEntry {
    /// Reports the outcome to the waiter, if any.
    pub fn resolve(mut self, status: DeliveryStatus) -> Message {
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(status);
        }
        self.message
    }
}

/// FIFO queue of undeliverable messages, scanned on a fixed tick.
#[derive(Default)]
pub struct RetryQueue {
    entries: Vec<RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(
        &mut self,
        message: Message,
        timeout: Option<Duration>,
        notify: Option<oneshot::Sender<DeliveryStatus>>,
    ) {
        self.entries.push(RetryEntry {
            message,
            timeout,
            notify,
            enqueued_at: Instant::now(),
        });
    }

    /// Removes and returns the entries whose destination now has an open
    /// connection, in enqueue order.
    pub fn take_deliverable<F>(&mut self, is_open: F) -> Vec<RetryEntry>
    where
        F: Fn(&PeerId) -> bool,
    {
        let mut deliverable = Vec::new();
        let mut retained = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if is_open(&entry.message.to) {
                deliverable.push(entry);
            } else {
                retained.push(entry);
            }
        }
        self.entries = retained;
        deliverable
    }

    /// Removes and returns the entries destined for one remote, in enqueue
    /// order.
    pub fn take_for(&mut self, remote: &PeerId) -> Vec<RetryEntry> {
        self.take_deliverable(|to| to == remote)
    }

    /// Removes and returns the entries whose per-entry timeout has
    /// elapsed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<RetryEntry> {
        let mut expired = Vec::new();
        let mut retained = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            let timed_out = entry
                .timeout
                .is_some_and(|timeout| now.duration_since(entry.enqueued_at) > timeout);
            if timed_out {
                expired.push(entry);
            } else {
                retained.push(entry);
            }
        }
        self.entries = retained;
        expired
    }
}
