//! Transport layer.
//!
//! A transport wraps one concrete link (a [`Carrier`]) and makes it usable
//! by an endpoint:
//!
//! - **State machine**: [`TransportState`] with a single mutation point
//! - **Reliability**: frames in transit until acknowledged, batched ACKs,
//!   head-of-line resend on acknowledgement gaps
//! - **Authentication**: per-frame tokens and challenge round trips
//! - **Keepalive**: [`KeepalivePredictor`] deciding when to ping and when
//!   the peer is gone
//! - **Liveness probes**: [`TransportEngine::is_alive`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Endpoint (TransportDelegate)     │
//! ├─────────────────────────────────────────┤
//! │           TransportEngine               │  ← This module
//! │  state, transit, acks, auth, keepalive  │
//! ├─────────────────────────────────────────┤
//! │         Carrier (raw link)              │
//! └─────────────────────────────────────────┘
//! ```

mod config;
mod engine;
mod error;
mod keepalive;
mod state;
mod timer;
mod traits;
mod transit;

pub use config::*;
pub use engine::{LivenessCheck, TransportEngine, TransportHandle};
pub use error::*;
pub use keepalive::{KeepaliveDelegate, KeepalivePolicy, KeepalivePredictor};
pub use state::TransportState;
pub use timer::{Scheduler, TimerHandle};
pub use traits::{Carrier, TransportDelegate};
pub use transit::{AckBatch, Acknowledged, TransitList};
