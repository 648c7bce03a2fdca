//! Error types for the forwarder.
//!
//! Only setup-time failures surface as [`Error`]. Once the forwarder runs,
//! delivery problems are logged and routed to the fallback sink instead of
//! being returned to producers.

use thiserror::Error;

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::signer::SignerError;

/// Main error type for the forwarder
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Workspace key cannot be used for signing
    #[error("invalid workspace key: {0}")]
    Signer(#[from] SignerError),

    /// HTTP client could not be set up
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] ClientError),

    /// `start` was called outside a tokio runtime
    #[error("no tokio runtime available to run the forwarder")]
    NoRuntime,
}

/// Result type alias for the forwarder
pub type Result<T> = std::result::Result<T, Error>;
