//! The segmented media fetcher.
//!
//! A media file is described by JSON metadata splitting it into a head
//! (everything before the first cluster) and numbered parts, one per
//! cluster. The fetcher drives metadata, head and part acquisition,
//! picking a random holding peer per part and falling back to the origin
//! server when no peer holds it or a peer request times out. Large parts
//! are chunked to fit the transport MTU and reassembled in order.

mod error;
mod fetcher;
mod metadata;
mod part;
mod sink;

pub use error::MediaError;
pub use fetcher::{Media, MediaFetcher, PartSource};
pub use metadata::{Cluster, MediaMetadata};
pub use part::{chunk_part, Part, PartRef, PartStatus};
pub use sink::{BufferSink, PlaybackSink};
