//! Error taxonomy shared by the store, discovery and manager.

use std::io;

use peer_upgrade_core::ListError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Peer unreachable, timed out, or answered with an error status.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Peer answered with something that is not an installer list.
    #[error("invalid peer response: {0}")]
    Validation(#[from] ListError),
    /// Received bytes do not hash to the declared value.
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    /// Bytes hash correctly but are not a usable installer package.
    #[error("invalid installer: {0}")]
    InvalidInstaller(String),
    #[error("installer not found: {0}")]
    NotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}
