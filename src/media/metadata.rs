//! Media metadata: the cluster table fetched from the origin.

use serde::{Deserialize, Serialize};

use super::error::MediaError;

/// One downloadable part's position in the file, beginning at a
/// keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Byte offset of the cluster within the media.
    pub offset: u64,
    /// Playback position of the cluster in seconds.
    pub timecode: f64,
}

/// The JSON document fetched from the metadata URL.
///
/// Cluster `i` spans bytes `[clusters[i].offset, clusters[i+1].offset - 1]`,
/// the last cluster runs to `size - 1`, and the head is everything before
/// `clusters[0].offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    /// Total media size in bytes.
    pub size: u64,
    /// Duration in seconds.
    pub duration: f64,
    pub clusters: Vec<Cluster>,
}

impl MediaMetadata {
    pub fn part_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn validate(&self) -> Result<(), MediaError> {
        if self.clusters.is_empty() {
            return Err(MediaError::InvalidMetadata("no clusters".to_string()));
        }
        let mut previous = None;
        for cluster in &self.clusters {
            if cluster.offset >= self.size {
                return Err(MediaError::InvalidMetadata(format!(
                    "cluster offset {} beyond size {}",
                    cluster.offset, self.size
                )));
            }
            if let Some(previous) = previous {
                if cluster.offset <= previous {
                    return Err(MediaError::InvalidMetadata(
                        "cluster offsets not strictly increasing".to_string(),
                    ));
                }
            }
            previous = Some(cluster.offset);
        }
        Ok(())
    }

    /// Inclusive byte range of the head, `None` when the first cluster
    /// starts at byte zero.
    pub fn head_range(&self) -> Option<(u64, u64)> {
        let first = self.clusters.first()?;
        if first.offset == 0 {
            return None;
        }
        Some((0, first.offset - 1))
    }

    /// Inclusive byte range of one part.
    pub fn part_range(&self, part: u32) -> Option<(u64, u64)> {
        let start = self.clusters.get(part as usize)?.offset;
        let end = match self.clusters.get(part as usize + 1) {
            Some(next) => next.offset - 1,
            None => self.size - 1,
        };
        Some((start, end))
    }
}
