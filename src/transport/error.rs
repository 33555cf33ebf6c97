//! Transport layer error types.

use std::io;

use thiserror::Error;

use super::TransportState;
use crate::auth::AuthError;
use crate::core::ConfigError;
use crate::wire::{Frame, FrameError};

/// Failure of a carrier's raw primitive.
#[derive(Debug, Error)]
pub enum CarrierError {
    /// The underlying link is gone.
    #[error("carrier link closed")]
    LinkClosed,

    /// I/O error on the underlying link.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The carrier refused the operation.
    #[error("carrier rejected operation: {0}")]
    Rejected(String),
}

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation not legal in the observed state.
    ///
    /// Carries the frame that could not be sent, if any.
    #[error("transport is {state}")]
    InvalidState {
        /// State observed when the operation was rejected.
        state: TransportState,
        /// Frame handed back to the caller.
        frame: Option<Box<Frame>>,
    },

    /// The carrier failed to write; the transport moved to `Error`.
    #[error("send failed in state {state}: {source}")]
    SendFailed {
        /// State at the time of failure.
        state: TransportState,
        /// Frames that were not delivered.
        frames: Vec<Frame>,
        /// Carrier failure.
        #[source]
        source: CarrierError,
    },

    /// The transport is disabled.
    #[error("transport is disabled")]
    Disabled,

    /// The carrier cannot initiate connections.
    #[error("transport cannot act as a client")]
    ClientUnsupported,

    /// Required client configuration is missing.
    #[error("transport not configured: {0}")]
    NotConfigured(String),

    /// Protocol violation.
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),

    /// Authentication failure.
    #[error("authentication: {0}")]
    Authentication(#[from] AuthError),

    /// Configuration error.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Carrier failure outside the send path.
    #[error("carrier: {0}")]
    Carrier(#[from] CarrierError),
}

impl TransportError {
    /// State carried by the error, if any.
    pub fn state(&self) -> Option<TransportState> {
        match self {
            TransportError::InvalidState { state, .. }
            | TransportError::SendFailed { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Frames carried by the error.
    pub fn frames(&self) -> Vec<&Frame> {
        match self {
            TransportError::InvalidState {
                frame: Some(frame), ..
            } => vec![frame.as_ref()],
            TransportError::SendFailed { frames, .. } => frames.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Take the frames carried by the error.
    pub fn into_frames(self) -> Vec<Frame> {
        match self {
            TransportError::InvalidState {
                frame: Some(frame), ..
            } => vec![*frame],
            TransportError::SendFailed { frames, .. } => frames,
            _ => Vec::new(),
        }
    }

    /// Check if this error leaves the transport unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::SendFailed { .. }
                | TransportError::Disabled
                | TransportError::ClientUnsupported
                | TransportError::NotConfigured(_)
                | TransportError::Protocol(_)
                | TransportError::Authentication(_)
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Operation;

    #[test]
    fn test_invalid_state_returns_frame() {
        let frame = Frame::message(1, 5, b"x".to_vec()).unwrap();
        let err = TransportError::InvalidState {
            state: TransportState::Connecting,
            frame: Some(Box::new(frame.clone())),
        };
        assert_eq!(err.state(), Some(TransportState::Connecting));
        assert_eq!(err.frames(), vec![&frame]);
        assert!(!err.is_fatal());
        assert_eq!(err.into_frames(), vec![frame]);
    }

    #[test]
    fn test_send_failed_is_fatal() {
        let err = TransportError::SendFailed {
            state: TransportState::Error,
            frames: vec![Frame::new(Operation::Message)],
            source: CarrierError::LinkClosed,
        };
        assert!(err.is_fatal());
        assert_eq!(err.frames().len(), 1);
        assert!(err.to_string().contains("carrier link closed"));
    }

    #[test]
    fn test_config_errors_carry_no_frames() {
        let err = TransportError::NotConfigured("remote".into());
        assert!(err.is_fatal());
        assert!(err.state().is_none());
        assert!(err.into_frames().is_empty());
    }
}
