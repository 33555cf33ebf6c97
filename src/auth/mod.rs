//! Pluggable per-frame authentication.
//!
//! An [`Authenticator`] is a strategy object injected into each transport.
//! It stamps outgoing frames with a token and verifies incoming ones. When
//! verification answers `false` the transport replies with a `CHALLENGE`
//! wrapping the rejected frame; the peer re-signs the frame against the
//! challenge and resends it.
//!
//! Authenticators see a small [`AuthContext`] describing the transport the
//! frame travels on. Which keys are filled in is agreed once, when the
//! authenticator is installed, through
//! [`Authenticator::negotiate_context_keys`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;

use crate::wire::{Format, Frame};

#[cfg(feature = "crypto")]
mod shared_secret;

#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub use shared_secret::SharedSecretAuthentication;

/// Errors raised by authenticators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The frame must not be accepted; the connection is torn down.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// The authenticator asked for a context key the transport cannot supply.
    #[error("unsupported context key: {0:?}")]
    UnsupportedContextKey(ContextKey),

    /// Key material could not be prepared.
    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// Context values a transport can supply to its authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Transport name.
    Transport,
    /// Carrier protocol name.
    Protocol,
    /// Current transport state.
    State,
    /// Time since data was last received.
    LastAlive,
    /// Wire format.
    Format,
    /// Transport priority.
    Priority,
    /// Carrier-specific configuration options, `key=value` joined by `;`.
    Configuration,
}

impl ContextKey {
    /// Every key.
    pub const ALL: [ContextKey; 7] = [
        ContextKey::Transport,
        ContextKey::Protocol,
        ContextKey::State,
        ContextKey::LastAlive,
        ContextKey::Format,
        ContextKey::Priority,
        ContextKey::Configuration,
    ];
}

/// A single context value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    /// Text value.
    Text(String),
    /// Integer value.
    Integer(i64),
    /// Wire format.
    Format(Format),
    /// Elapsed time, `None` when nothing has happened yet.
    Elapsed(Option<Duration>),
}

/// Values for the negotiated context keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    values: HashMap<ContextKey, ContextValue>,
}

impl AuthContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn insert(&mut self, key: ContextKey, value: ContextValue) {
        self.values.insert(key, value);
    }

    /// Get a value.
    pub fn get(&self, key: ContextKey) -> Option<&ContextValue> {
        self.values.get(&key)
    }

    /// Get a text value.
    pub fn text(&self, key: ContextKey) -> Option<&str> {
        match self.values.get(&key) {
            Some(ContextValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Number of values present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no values are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-frame authentication strategy.
///
/// Implementations are shared between the transports of one endpoint and
/// must be internally synchronized.
pub trait Authenticator: Send + Sync {
    /// Pick the context keys this authenticator needs out of `offered`.
    ///
    /// Returning a key that was not offered makes installation fail.
    fn negotiate_context_keys(
        &self,
        offered: &HashSet<ContextKey>,
    ) -> Result<HashSet<ContextKey>, AuthError>;

    /// Check an incoming frame.
    ///
    /// `Ok(false)` triggers a challenge round trip. `Err` is fail-closed: the
    /// transport disconnects and drops the frame.
    fn verify(&self, frame: &Frame, context: &AuthContext) -> Result<bool, AuthError>;

    /// Challenge string for a frame that failed verification.
    fn create_challenge(&self, frame: &Frame, context: &AuthContext) -> String;

    /// Token for an outgoing frame, optionally answering `challenge`.
    ///
    /// An empty string sends the frame without a token.
    fn create_response(
        &self,
        challenge: Option<&Frame>,
        outgoing: &Frame,
        context: &AuthContext,
    ) -> String;
}

/// Authenticator that accepts everything and signs nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuthentication;

impl Authenticator for NullAuthentication {
    fn negotiate_context_keys(
        &self,
        _offered: &HashSet<ContextKey>,
    ) -> Result<HashSet<ContextKey>, AuthError> {
        Ok(HashSet::new())
    }

    fn verify(&self, _frame: &Frame, _context: &AuthContext) -> Result<bool, AuthError> {
        Ok(true)
    }

    fn create_challenge(&self, _frame: &Frame, _context: &AuthContext) -> String {
        String::new()
    }

    fn create_response(
        &self,
        _challenge: Option<&Frame>,
        _outgoing: &Frame,
        _context: &AuthContext,
    ) -> String {
        String::new()
    }
}
