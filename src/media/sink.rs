//! The playback sink contract.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

/// An opaque consumer of the reassembled media stream.
///
/// The fetcher initializes it with the head buffer, appends parts
/// strictly in part order, and calls `finish` once after the last part.
pub trait PlaybackSink: Send + Sync {
    fn initialize(&self, head: Bytes);
    fn append(&self, part: Bytes);
    fn finish(&self);
}

/// A sink that accumulates everything in memory. Useful for tests and
/// for piping the stream elsewhere after completion.
#[derive(Default)]
pub struct BufferSink {
    head: Mutex<Option<Bytes>>,
    parts: Mutex<Vec<Bytes>>,
    finished: AtomicBool,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<Bytes> {
        self.head.lock().clone()
    }

    pub fn parts(&self) -> Vec<Bytes> {
        self.parts.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// The whole stream, head included, as collected so far.
    pub fn assembled(&self) -> Bytes {
        let mut buffer = Vec::new();
        if let Some(head) = self.head.lock().as_ref() {
            buffer.extend_from_slice(head);
        }
        for part in self.parts.lock().iter() {
            buffer.extend_from_slice(part);
        }
        Bytes::from(buffer)
    }
}

impl PlaybackSink for BufferSink {
    fn initialize(&self, head: Bytes) {
        *self.head.lock() = Some(head);
    }

    fn append(&self, part: Bytes) {
        self.parts.lock().push(part);
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}
