//! Crate-level error types.

use thiserror::Error;

use crate::auth::AuthError;
use crate::wire::FrameError;

/// Errors raised while parsing configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The value could not be parsed for this key.
    #[error("invalid value {value:?} for option {key:?}")]
    InvalidValue {
        /// Option key, without any transport prefix.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// The option cannot change while the transport is live.
    #[error("option {0:?} cannot change in the current state")]
    Locked(String),
}

/// Top-level relaywire errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame codec error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error.
    #[cfg(feature = "transport")]
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
