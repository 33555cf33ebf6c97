//! Operation codes and wire formats.

use std::fmt;
use std::str::FromStr;

use super::FrameError;

/// Frame operation code.
///
/// The set is closed. Values 0, 7 and 12-15 are reserved and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Opens a session on this transport.
    Open = 1,
    /// Confirms an `Open`.
    Opened = 2,
    /// Graceful close of the transport.
    Close = 3,
    /// Terminal signal for the session.
    End = 4,
    /// Authentication challenge wrapping the rejected frame.
    Challenge = 5,
    /// Error report for the upper layer.
    Error = 6,
    /// Application message.
    Message = 8,
    /// Delivery acknowledgement.
    Ack = 9,
    /// First fragment of a split message.
    FragmentStart = 10,
    /// Last fragment of a split message.
    FragmentEnd = 11,
    /// Generic positive response.
    Ok = 16,
    /// Keepalive ping.
    Ping = 17,
    /// Keepalive pong.
    Pong = 18,
    /// Opaque relay traffic.
    Transport = 19,
}

impl Operation {
    /// Every defined operation, in code order.
    pub const ALL: [Operation; 14] = [
        Operation::Open,
        Operation::Opened,
        Operation::Close,
        Operation::End,
        Operation::Challenge,
        Operation::Error,
        Operation::Message,
        Operation::Ack,
        Operation::FragmentStart,
        Operation::FragmentEnd,
        Operation::Ok,
        Operation::Ping,
        Operation::Pong,
        Operation::Transport,
    ];

    /// Parse an operation code.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Open),
            2 => Some(Self::Opened),
            3 => Some(Self::Close),
            4 => Some(Self::End),
            5 => Some(Self::Challenge),
            6 => Some(Self::Error),
            8 => Some(Self::Message),
            9 => Some(Self::Ack),
            10 => Some(Self::FragmentStart),
            11 => Some(Self::FragmentEnd),
            16 => Some(Self::Ok),
            17 => Some(Self::Ping),
            18 => Some(Self::Pong),
            19 => Some(Self::Transport),
            _ => None,
        }
    }

    /// Get the numeric code.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Upper-case protocol name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Opened => "OPENED",
            Self::Close => "CLOSE",
            Self::End => "END",
            Self::Challenge => "CHALLENGE",
            Self::Error => "ERROR",
            Self::Message => "MESSAGE",
            Self::Ack => "ACK",
            Self::FragmentStart => "FRAGMENT_START",
            Self::FragmentEnd => "FRAGMENT_END",
            Self::Ok => "OK",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Transport => "TRANSPORT",
        }
    }
}

impl TryFrom<u8> for Operation {
    type Error = FrameError;

    fn try_from(b: u8) -> Result<Self, FrameError> {
        Self::from_byte(b).ok_or(FrameError::UnknownOperation(b))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire format of a connection.
///
/// Fixed for the lifetime of a connection once it is `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    /// 8-bit clean binary layout.
    #[default]
    Regular,
    /// Every byte stays within 0..=127, for carriers that mangle high bytes.
    SevenBit,
}

impl Format {
    /// Configuration name of the format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::SevenBit => "7bit",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" | "8bit" => Ok(Self::Regular),
            "7bit" | "seven_bit" | "sevenbit" => Ok(Self::SevenBit),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_byte(op.as_byte()), Some(op));
        }
    }

    #[test]
    fn test_reserved_codes_rejected() {
        for b in [0u8, 7, 12, 13, 14, 15, 20, 63] {
            assert!(Operation::from_byte(b).is_none(), "code {b} should be rejected");
            assert!(matches!(
                Operation::try_from(b),
                Err(FrameError::UnknownOperation(x)) if x == b
            ));
        }
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("regular".parse::<Format>(), Ok(Format::Regular));
        assert_eq!("7BIT".parse::<Format>(), Ok(Format::SevenBit));
        assert!("base64".parse::<Format>().is_err());
        assert_eq!(Format::default(), Format::Regular);
    }
}
