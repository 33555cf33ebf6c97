//! Protocol constants.
//!
//! Wire sizes are fixed by the frame format. Timing values are the defaults a
//! [`TransportConfig`](crate::transport::TransportConfig) starts from.

use std::time::Duration;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Fixed frame header size, identical for both wire formats.
pub const HEADER_SIZE: usize = 16;

/// Highest valid channel id.
pub const MAX_CHANNEL: u8 = 63;

/// Channel reserved for control traffic.
pub const CONTROL_CHANNEL: u8 = 0;

/// Message id meaning "no delivery tracking requested".
pub const UNTRACKED_MESSAGE_ID: u32 = 0;

/// Longest auth token either format can describe.
pub const MAX_AUTH_LEN: usize = u16::MAX as usize;

/// Largest packed payload a 7-bit header can describe (28 bits).
pub const MAX_SEVEN_BIT_LEN: usize = (1 << 28) - 1;

/// Message ids carried in 7-bit ACK entries are truncated to 28 bits.
pub const SEVEN_BIT_ACK_ID_MASK: u32 = 0x0FFF_FFFF;

/// Regular-format ACK entry: channel byte plus big-endian id.
pub const ACK_ENTRY_SIZE: usize = 5;

/// 7-bit ACK entry: four 7-bit groups.
pub const SEVEN_BIT_ACK_ENTRY_SIZE: usize = 4;

/// Keepalive payload prefix: type marker plus six interval characters.
pub const KEEPALIVE_HEADER_SIZE: usize = 7;

/// Maximum bytes of an offending buffer written to the debug log.
pub const MAX_DIAGNOSTIC_DUMP: usize = 400;

// =============================================================================
// ACKNOWLEDGEMENT BATCHING
// =============================================================================

/// Rolling ack buffer size.
pub const DEFAULT_ACK_BUFFER_SIZE: usize = 640;

/// Acks closer together than this are coalesced.
pub const ACK_COALESCE_WINDOW: Duration = Duration::from_millis(5);

/// Deferred ack flush delay.
pub const ACK_FLUSH_DELAY: Duration = Duration::from_millis(6);

// =============================================================================
// TRANSPORT TIMING
// =============================================================================

/// Connect attempts still unresolved after this are torn down.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay before buffered control frames are flushed after (re)connecting.
pub const DEFAULT_CONTROL_FLUSH_DELAY: Duration = Duration::from_millis(5);

// =============================================================================
// KEEPALIVE
// =============================================================================

/// Interval used when the policy is "default", in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL: u32 = 5 * 60;

/// Smallest accepted keepalive interval, in seconds.
pub const MIN_KEEPALIVE_INTERVAL: u32 = 1;

/// Largest accepted keepalive interval, in seconds. Six decimal digits.
pub const MAX_KEEPALIVE_INTERVAL: u32 = 999_999;

/// Lower auto-tune bound, in seconds.
pub const MIN_AUTO_KEEPALIVE_INTERVAL: u32 = 1;

/// Upper auto-tune bound, in seconds.
pub const MAX_AUTO_KEEPALIVE_INTERVAL: u32 = 28 * 60;

/// Grace period after an unanswered ping before the peer is declared gone.
pub const DEFAULT_KEEPALIVE_EXPIRY: Duration = Duration::from_millis(5000);

/// Deadlines closer than this are treated as due now.
pub const KEEPALIVE_DUE_WINDOW: Duration = Duration::from_millis(500);

/// Shortest predictor wakeup.
pub const MIN_KEEPALIVE_WAKEUP: Duration = Duration::from_millis(501);

/// An armed wakeup is kept if it fires no later than this after the new one.
pub const KEEPALIVE_RESCHEDULE_TOLERANCE: Duration = Duration::from_millis(250);

/// Random part of a keepalive token, in bytes before hex encoding.
pub const KEEPALIVE_TOKEN_SIZE: usize = 8;
