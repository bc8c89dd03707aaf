//! Error types for the histovit crates.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested architecture name is not in the model catalog.
    #[error("Unknown architecture: {0}")]
    UnknownArchitecture(String),

    /// A weight artifact could not be fetched.
    #[error("Download failed: {0}")]
    Download(String),

    /// A checkpoint did not line up with the constructed architecture.
    /// Strict loading never partially applies a state dict.
    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    /// Model construction failed after the checkpoint verified.
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}
