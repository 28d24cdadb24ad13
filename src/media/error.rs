use thiserror::Error;

/// Errors that can occur in the media layer.
#[derive(Debug, Error)]
pub enum MediaError {
    /// A media message referenced a URL this fetcher does not track.
    #[error("unknown media url: {0}")]
    UnknownMedia(String),

    /// A part arrived for a slot that is not waiting for one.
    #[error("part {part} of {url} is not pending")]
    UnexpectedPart { url: String, part: u32 },

    /// A part number field could not be parsed (`"P"` or `"P:C:N"`).
    #[error("invalid part number: {0}")]
    InvalidPartNumber(String),

    /// A part number is outside the cluster table.
    #[error("part {0} out of range")]
    PartOutOfRange(u32),

    /// The metadata is structurally unusable.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}
