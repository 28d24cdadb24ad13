//! Parts, chunk accumulation, and the `"P:C:N"` numbering scheme.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use super::error::MediaError;

/// Lifecycle of one part.
///
/// Progresses `Needed -> Pending -> Available -> Added` and never
/// regresses, except `Pending -> Needed` when an origin fetch fails and
/// the part must be rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartStatus {
    /// Not yet requested anywhere.
    Needed,
    /// An outbound request is in flight.
    Pending,
    /// All bytes collected, not yet handed to the playback sink.
    Available,
    /// Appended to the playback sink.
    Added,
}

/// One cluster's bytes and download state.
#[derive(Debug, Clone)]
pub struct Part {
    pub number: u32,
    pub status: PartStatus,
    /// The full part buffer, set once all chunks have been collected.
    pub data: Option<Bytes>,
    chunks: HashMap<u32, Bytes>,
    expected_chunks: Option<u32>,
}

impl Part {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            status: PartStatus::Needed,
            data: None,
            chunks: HashMap::new(),
            expected_chunks: None,
        }
    }

    /// Stores a complete, unchunked part buffer.
    pub fn accept_whole(&mut self, data: Bytes) {
        self.data = Some(data);
        self.chunks.clear();
        self.expected_chunks = None;
        self.status = PartStatus::Available;
    }

    /// Stores one chunk of `total`. Returns `true` once the last chunk
    /// arrives and the part has been reassembled.
    pub fn accept_chunk(&mut self, index: u32, total: u32, data: Bytes) -> bool {
        if total == 0 || index >= total {
            return false;
        }
        let expected = *self.expected_chunks.get_or_insert(total);
        if expected != total {
            return false;
        }
        self.chunks.insert(index, data);
        if self.chunks.len() as u32 == expected {
            self.assemble(expected);
            return true;
        }
        false
    }

    fn assemble(&mut self, total: u32) {
        let mut buffer = Vec::new();
        for index in 0..total {
            if let Some(chunk) = self.chunks.get(&index) {
                buffer.extend_from_slice(chunk);
            }
        }
        self.data = Some(Bytes::from(buffer));
        self.chunks.clear();
        self.expected_chunks = None;
        self.status = PartStatus::Available;
    }

    pub fn collected_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// A parsed part number: a bare part (`"17"`) or one chunk of a chunked
/// part (`"17:2:5"` - part 17, chunk 2 of 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRef {
    pub part: u32,
    pub chunk: Option<(u32, u32)>,
}

impl PartRef {
    pub fn whole(part: u32) -> Self {
        Self { part, chunk: None }
    }

    pub fn chunked(part: u32, index: u32, total: u32) -> Self {
        Self {
            part,
            chunk: Some((index, total)),
        }
    }
}

impl FromStr for PartRef {
    type Err = MediaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || MediaError::InvalidPartNumber(value.to_string());
        let fields: Vec<&str> = value.split(':').collect();
        match fields.as_slice() {
            [part] => {
                let part = part.parse().map_err(|_| invalid())?;
                Ok(PartRef::whole(part))
            }
            [part, index, total] => {
                let part = part.parse().map_err(|_| invalid())?;
                let index = index.parse().map_err(|_| invalid())?;
                let total: u32 = total.parse().map_err(|_| invalid())?;
                if total == 0 || index >= total {
                    return Err(invalid());
                }
                Ok(PartRef::chunked(part, index, total))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk {
            Some((index, total)) => write!(f, "{}:{}:{}", self.part, index, total),
            None => write!(f, "{}", self.part),
        }
    }
}

/// Splits a part buffer into chunks of at most `chunk_size` bytes.
///
/// Slicing is zero-copy; every byte lands in exactly one chunk and
/// concatenating the chunks in order restores the original buffer.
pub fn chunk_part(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if data.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let count = data.len().div_ceil(chunk_size);
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    chunks
}
