//! Error types for the streaming layer

use std::io;
use thiserror::Error;

/// Result type for streaming-layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for streaming-layer operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error (thread spawning, transport plumbing)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A page fetch against the remote API failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A raw record could not be deserialized into a typed entity
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A transform produced no output for an item
    #[error("Transform produced no output")]
    EmptyTransform,

    /// A transform failed on an item
    #[error("Transform error: {0}")]
    Transform(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
