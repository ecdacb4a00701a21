//! Error types for cadenza-core.

use thiserror::Error;

/// Error type for cadenza-core operations.
///
/// Configuration failures are ordinary `Err` values so call sites near the
/// real-time path can branch on them inline. Contract violations (reading a
/// closed source, out-of-bounds container access) are debug assertions, not
/// errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid block size: {0}. Must be non-zero")]
    InvalidBlockSize(usize),

    #[error("Invalid sample rate: {0}. Must be positive and finite")]
    InvalidSampleRate(f64),

    #[error("Invalid range: start={start}, end={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Clip length must be non-zero")]
    EmptyClip,

    #[error("Source is already a member")]
    DuplicateSource,

    #[error("A mixer cannot contain itself")]
    SelfReference,

    #[error("No member with the given id")]
    SourceNotFound,

    #[error("Content already has a clip on this timeline")]
    DuplicateContent,

    #[error("No clip with the given content")]
    ClipNotFound,

    #[error("Source failed to open: {0}")]
    OpenFailed(String),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
