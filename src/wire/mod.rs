//! Wire layer: frames, operation codes and payload encodings.
//!
//! Everything here is pure and stateless. The transport engine feeds
//! received bytes through [`Frame::decode`] until it reports that more data
//! is needed, keeping the remainder for the next delivery.

mod ack;
mod error;
mod frame;
mod keepalive;
mod operation;
pub mod septet;

pub use ack::AckEntry;
pub use error::FrameError;
pub use frame::Frame;
pub use keepalive::{KeepaliveKind, KeepalivePayload};
pub use operation::{Format, Operation};
