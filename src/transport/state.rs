//! Transport lifecycle state.

use std::fmt;

/// Transport lifecycle state.
///
/// ```text
///                connect()            carrier up            OPEN/OPENED
/// Disconnected ───────────► Connecting ──────────► Connected ─────────► Available
///      ▲                                                │  ▲                │  ▲
///      │ CLOSE / carrier down / keepalive expired       │  └─ Unavailable ◄─┘  │
///      └────────────── Disconnecting ◄── disconnect() ──┴──────────────────────┘
///
/// Error is terminal; reset() brings the transport back to Disconnected.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportState {
    /// Not connected. Initial state.
    #[default]
    Disconnected,
    /// Carrier connect in progress.
    Connecting,
    /// Carrier link is up; session not yet opened.
    Connected,
    /// Session open, ready for application traffic.
    Available,
    /// Session open but temporarily unable to carry traffic.
    Unavailable,
    /// Close handshake in progress.
    Disconnecting,
    /// Failed. Terminal until reset.
    Error,
}

impl TransportState {
    /// Whether `send()` is accepted.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Available | Self::Connected)
    }

    /// Whether buffered control frames may be written.
    pub fn can_flush_control(self) -> bool {
        matches!(
            self,
            Self::Available | Self::Connected | Self::Connecting | Self::Disconnecting
        )
    }

    /// Whether the transport has left (or is leaving) the connected states.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Disconnected | Self::Disconnecting | Self::Error)
    }

    /// Whether the transport is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_states() {
        assert!(TransportState::Available.can_send());
        assert!(TransportState::Connected.can_send());
        assert!(!TransportState::Unavailable.can_send());
        assert!(!TransportState::Connecting.can_send());
        assert!(!TransportState::Disconnecting.can_send());
    }

    #[test]
    fn test_control_flush_states() {
        assert!(TransportState::Connecting.can_flush_control());
        assert!(TransportState::Disconnecting.can_flush_control());
        assert!(!TransportState::Unavailable.can_flush_control());
        assert!(!TransportState::Disconnected.can_flush_control());
        assert!(!TransportState::Error.can_flush_control());
    }

    #[test]
    fn test_default_is_disconnected() {
        assert_eq!(TransportState::default(), TransportState::Disconnected);
        assert!(TransportState::default().is_terminal());
    }
}
