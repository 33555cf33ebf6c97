//! # relaywire
//!
//! Per-transport reliability engine for multiplexed message endpoints.
//!
//! A transport takes one raw link and provides:
//!
//! - **Framing**: a 16-byte header binary codec in a regular and a 7-bit
//!   safe format
//! - **State**: a connection state machine with deterministic teardown
//! - **Reliability**: frames tracked until acknowledged, batched ACKs and
//!   resend on acknowledgement gaps
//! - **Authentication**: pluggable per-frame tokens with challenge-response
//! - **Liveness**: an adaptive keepalive predictor and on-demand probes
//!
//! ## Feature Flags
//!
//! - `transport` (default): Transport engine, timers and keepalive
//! - `crypto` (default): Shared-secret authenticator (HKDF, BLAKE2s)
//! - `compression` (default): zstd compression of flagged frame payloads
//! - `loopback` (default): In-process carrier for tests and local relays
//!
//! ## Modules
//!
//! - [`core`]: Constants and crate-level error types (always included)
//! - [`wire`]: Frame codec, ACK and keepalive payloads (always included)
//! - [`auth`]: Authenticator trait and implementations (always included)
//! - [`extensions`]: Payload compression
//! - [`transport`]: Transport engine (requires `transport` feature)
//! - [`loopback`]: Loopback carrier (requires `loopback` feature)
//!
//! ## Example Usage
//!
//! ```rust
//! use relaywire::prelude::*;
//!
//! let frame = Frame::message(3, 42, b"hello".to_vec())?;
//! let bytes = frame.serialize()?;
//!
//! let (decoded, consumed) = Frame::decode(&bytes)?.expect("complete frame");
//! assert_eq!(consumed, bytes.len());
//! assert_eq!(decoded, frame);
//! # Ok::<(), relaywire::FrameError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Wire format (always included)
pub mod wire;

// Authentication (always included; shared-secret scheme needs `crypto`)
pub mod auth;

// Extensions (individually feature-gated)
pub mod extensions;

// Transport engine (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Loopback carrier (feature-gated)
#[cfg(feature = "loopback")]
#[cfg_attr(docsrs, doc(cfg(feature = "loopback")))]
pub mod loopback;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{ConfigError, RelayError};
    pub use crate::wire::{AckEntry, Format, Frame, FrameError, Operation};

    pub use crate::auth::{AuthContext, AuthError, Authenticator, ContextKey, NullAuthentication};

    #[cfg(feature = "crypto")]
    pub use crate::auth::SharedSecretAuthentication;

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        Carrier, CarrierError, KeepalivePolicy, TransportConfig, TransportConfigBuilder,
        TransportDelegate, TransportEngine, TransportError, TransportHandle, TransportResult,
        TransportState,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{ConfigError, RelayError};
pub use crate::wire::{Format, Frame, FrameError, Operation};

#[cfg(feature = "transport")]
pub use crate::transport::{TransportEngine, TransportError, TransportState};
