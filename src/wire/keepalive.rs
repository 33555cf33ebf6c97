//! Keepalive payload carried by PING and PONG frames.
//!
//! ```text
//! byte 0     type marker: '1' fixed, '2' renegotiate, '3' on-demand probe
//! bytes 1-6  proposed interval in seconds, zero-padded decimal ("-00005" when negative)
//! bytes 7..  correlation token, echoed verbatim
//! ```

use super::FrameError;
use crate::core::{KEEPALIVE_HEADER_SIZE, MAX_KEEPALIVE_INTERVAL};

/// Keepalive type marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeepaliveKind {
    /// Fixed interval, no renegotiation.
    Fixed,
    /// Sender proposes a new interval.
    Renegotiate,
    /// On-demand liveness probe, answered immediately.
    Probe,
}

impl KeepaliveKind {
    /// ASCII marker byte.
    pub fn marker(self) -> u8 {
        match self {
            Self::Fixed => b'1',
            Self::Renegotiate => b'2',
            Self::Probe => b'3',
        }
    }

    /// Parse a marker byte.
    pub fn from_marker(b: u8) -> Option<Self> {
        match b {
            b'1' => Some(Self::Fixed),
            b'2' => Some(Self::Renegotiate),
            b'3' => Some(Self::Probe),
            _ => None,
        }
    }
}

/// Decoded PING/PONG payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivePayload {
    /// Type marker.
    pub kind: KeepaliveKind,
    /// Proposed interval in seconds.
    pub interval: i32,
    /// Correlation token.
    pub token: Vec<u8>,
}

impl KeepalivePayload {
    /// Create a payload.
    pub fn new(kind: KeepaliveKind, interval: i32, token: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            interval,
            token: token.into(),
        }
    }

    /// Encode to frame payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let digits = if self.interval < 0 {
            format!("-{:05}", self.interval.unsigned_abs().min(99_999))
        } else {
            format!("{:06}", self.interval.unsigned_abs().min(MAX_KEEPALIVE_INTERVAL))
        };
        let mut out = Vec::with_capacity(KEEPALIVE_HEADER_SIZE + self.token.len());
        out.push(self.kind.marker());
        out.extend_from_slice(digits.as_bytes());
        out.extend_from_slice(&self.token);
        out
    }

    /// Decode frame payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < KEEPALIVE_HEADER_SIZE {
            return Err(FrameError::InvalidKeepalive(format!(
                "{} bytes, need at least {KEEPALIVE_HEADER_SIZE}",
                payload.len()
            )));
        }
        let kind = KeepaliveKind::from_marker(payload[0]).ok_or_else(|| {
            FrameError::InvalidKeepalive(format!("type marker {:#04x}", payload[0]))
        })?;
        let digits = std::str::from_utf8(&payload[1..KEEPALIVE_HEADER_SIZE])
            .map_err(|_| FrameError::InvalidKeepalive("interval is not ASCII".into()))?;
        let interval = digits
            .parse::<i32>()
            .map_err(|_| FrameError::InvalidKeepalive(format!("interval {digits:?}")))?;

        Ok(Self {
            kind,
            interval,
            token: payload[KEEPALIVE_HEADER_SIZE..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let p = KeepalivePayload::new(KeepaliveKind::Renegotiate, 300, b"abc".to_vec());
        assert_eq!(p.encode(), b"2000300abc");
    }

    #[test]
    fn test_negative_interval() {
        let p = KeepalivePayload::new(KeepaliveKind::Fixed, -1, Vec::new());
        let bytes = p.encode();
        assert_eq!(bytes, b"1-00001");
        assert_eq!(KeepalivePayload::decode(&bytes).unwrap(), p);
    }

    #[test]
    fn test_interval_clamped_to_six_digits() {
        let p = KeepalivePayload::new(KeepaliveKind::Fixed, 5_000_000, b"t".to_vec());
        let decoded = KeepalivePayload::decode(&p.encode()).unwrap();
        assert_eq!(decoded.interval, 999_999);
    }

    #[test]
    fn test_probe_roundtrip() {
        let p = KeepalivePayload::new(KeepaliveKind::Probe, 0, b"token-xyz".to_vec());
        assert_eq!(KeepalivePayload::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(KeepalivePayload::decode(b"1000").is_err());
        assert!(KeepalivePayload::decode(b"9000300tok").is_err());
        assert!(KeepalivePayload::decode(b"1abcdeftok").is_err());
    }
}
