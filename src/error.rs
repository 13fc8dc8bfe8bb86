use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the daemon core (see the error handling design notes).
///
/// Anything time-dependent that would merely no-op on an unsynced clock, or a
/// dropped sample from a monotonicity violation, is not represented here —
/// those are silent, not erroneous.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed block at {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("corrupt block at {path}")]
    CorruptBlock { path: PathBuf },

    #[error("broker error: {0}")]
    Broker(String),

    #[error("sensor registry error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem stat error: {0}")]
    Stat(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
