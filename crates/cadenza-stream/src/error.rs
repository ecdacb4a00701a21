//! Error types for cadenza-stream.

use thiserror::Error;

/// Error type for cadenza-stream operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] cadenza_core::Error),

    #[error("Clip window overlaps an existing clip")]
    OverlappingClip,

    #[error("Codec: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
