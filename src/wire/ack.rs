//! ACK payload encoding.
//!
//! Regular format: `[channel u8][message id u32 BE]` per entry.
//! 7-bit format: four septets per entry carrying a 28-bit id, channel 0.

use super::septet;
use super::{Format, FrameError};
use crate::core::{ACK_ENTRY_SIZE, SEVEN_BIT_ACK_ENTRY_SIZE, SEVEN_BIT_ACK_ID_MASK};

/// One acknowledged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckEntry {
    /// Channel the message travelled on.
    pub channel: u8,
    /// Acknowledged message id.
    pub message_id: u32,
}

impl AckEntry {
    /// Create an entry.
    pub fn new(channel: u8, message_id: u32) -> Self {
        Self {
            channel,
            message_id,
        }
    }

    /// Bytes one entry occupies in `format`.
    pub fn encoded_len(format: Format) -> usize {
        match format {
            Format::Regular => ACK_ENTRY_SIZE,
            Format::SevenBit => SEVEN_BIT_ACK_ENTRY_SIZE,
        }
    }

    /// Append this entry to an ACK payload.
    pub fn encode_into(&self, format: Format, out: &mut Vec<u8>) {
        match format {
            Format::Regular => {
                out.push(self.channel);
                out.extend_from_slice(&self.message_id.to_be_bytes());
            }
            Format::SevenBit => out.extend_from_slice(&septet::encode_u28(self.message_id)),
        }
    }

    /// Decode every entry of an ACK payload.
    pub fn decode_all(payload: &[u8], format: Format) -> Result<Vec<AckEntry>, FrameError> {
        let size = Self::encoded_len(format);
        if payload.len() % size != 0 {
            return Err(FrameError::InvalidAckPayload(payload.len()));
        }
        payload
            .chunks_exact(size)
            .map(|chunk| match format {
                Format::Regular => Ok(AckEntry::new(
                    chunk[0],
                    u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]),
                )),
                Format::SevenBit => {
                    if let Some(&bad) = chunk.iter().find(|b| **b > 0x7F) {
                        return Err(FrameError::NotSevenBitClean(bad));
                    }
                    Ok(AckEntry::new(
                        0,
                        septet::decode_u28(&[chunk[0], chunk[1], chunk[2], chunk[3]]),
                    ))
                }
            })
            .collect()
    }

    /// Whether this entry acknowledges `(channel, message_id)` in `format`.
    ///
    /// 7-bit entries carry neither the channel nor the top four id bits.
    pub fn matches(&self, format: Format, channel: u8, message_id: u32) -> bool {
        match format {
            Format::Regular => self.channel == channel && self.message_id == message_id,
            Format::SevenBit => {
                self.message_id & SEVEN_BIT_ACK_ID_MASK == message_id & SEVEN_BIT_ACK_ID_MASK
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_entries() {
        let mut buf = Vec::new();
        AckEntry::new(3, 0x0102_0304).encode_into(Format::Regular, &mut buf);
        AckEntry::new(63, 7).encode_into(Format::Regular, &mut buf);
        assert_eq!(&buf[..5], &[3, 1, 2, 3, 4]);

        let entries = AckEntry::decode_all(&buf, Format::Regular).unwrap();
        assert_eq!(entries, vec![AckEntry::new(3, 0x0102_0304), AckEntry::new(63, 7)]);
    }

    #[test]
    fn test_seven_bit_entries_drop_channel() {
        let mut buf = Vec::new();
        AckEntry::new(9, 1000).encode_into(Format::SevenBit, &mut buf);
        assert_eq!(buf.len(), 4);
        assert!(buf.iter().all(|b| *b <= 0x7F));

        let entries = AckEntry::decode_all(&buf, Format::SevenBit).unwrap();
        assert_eq!(entries, vec![AckEntry::new(0, 1000)]);
        assert!(entries[0].matches(Format::SevenBit, 9, 1000));
        assert!(!entries[0].matches(Format::Regular, 9, 1000));
    }

    #[test]
    fn test_ragged_payload_rejected() {
        assert!(matches!(
            AckEntry::decode_all(&[1, 2, 3], Format::Regular),
            Err(FrameError::InvalidAckPayload(3))
        ));
        assert!(AckEntry::decode_all(&[], Format::Regular).unwrap().is_empty());
    }
}
