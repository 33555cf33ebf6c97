//! Frame codec error types.

use thiserror::Error;

#[cfg(feature = "compression")]
use crate::extensions::CompressionError;

/// Errors produced while encoding or decoding frames.
///
/// A buffer that simply holds too few bytes is not an error: decoding
/// reports it as `Ok(None)` so callers can keep accumulating.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Operation code outside the closed set.
    #[error("unknown operation code: {0}")]
    UnknownOperation(u8),

    /// First header byte does not carry a recognised format marker.
    #[error("malformed frame header (lead byte {0:#04x})")]
    MalformedHeader(u8),

    /// Byte above 0x7F found where the 7-bit format requires ASCII.
    #[error("byte {0:#04x} in a 7-bit frame")]
    NotSevenBitClean(u8),

    /// Channel id outside 0..=63.
    #[error("invalid channel: {0} (must be 0-63)")]
    InvalidChannel(u8),

    /// Auth token contains bytes outside printable ASCII.
    #[error("auth token is not printable ASCII")]
    InvalidAuth,

    /// Auth token longer than the 16-bit length field allows.
    #[error("auth token too long: {0} bytes")]
    AuthTooLong(usize),

    /// Payload longer than the header can describe.
    #[error("payload too large: {size} > {limit}")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Largest size the format allows.
        limit: usize,
    },

    /// ACK payload is not a whole number of entries.
    #[error("ack payload of {0} bytes is not a whole number of entries")]
    InvalidAckPayload(usize),

    /// Keepalive payload could not be parsed.
    #[error("invalid keepalive payload: {0}")]
    InvalidKeepalive(String),

    /// Payload compression or decompression failed.
    #[cfg(feature = "compression")]
    #[error("compression: {0}")]
    Compression(#[from] CompressionError),

    /// Frame is flagged compressed but compression support is not built in.
    #[error("compressed frames require the `compression` feature")]
    CompressionUnavailable,
}
