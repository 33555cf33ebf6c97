//! Frame type and codec.
//!
//! Both formats share a 16-byte header followed by the auth token and the
//! payload.
//!
//! ```text
//! Regular (8-bit clean):
//!  0       1       2-3        4-7          8    9       10-11  12-15
//! +-------+-------+----------+------------+----+-------+------+-------------+
//! |10 op  |C rsvd | auth len | message id |  0 |channel|   0  | payload len |
//! +-------+-------+----------+------------+----+-------+------+-------------+
//!
//! 7-bit safe (every byte <= 0x7F):
//!  0       1         2-3        4-7            8        9       10-11  12-15
//! +-------+---------+----------+--------------+--------+-------+------+-------------+
//! |00 op  |0C000 aa | auth len | id bits 0-27 | id hi  |channel|   0  | packed len  |
//! +-------+---------+----------+--------------+--------+-------+------+-------------+
//! ```
//!
//! In the 7-bit format the payload is bit-packed into septets (see
//! [`septet`](super::septet)).

use std::fmt;

use super::septet;
use super::{Format, FrameError, Operation};
use crate::core::{HEADER_SIZE, MAX_AUTH_LEN, MAX_CHANNEL, MAX_SEVEN_BIT_LEN};

/// Lead-byte marker of the regular format.
const REGULAR_MARKER: u8 = 0x80;

/// Mask covering the two format bits of the lead byte.
const MARKER_MASK: u8 = 0xC0;

/// Compressed flag in byte 1 of a regular header.
const REGULAR_COMPRESSED: u8 = 0x80;

/// Compressed flag in byte 1 of a 7-bit header.
const SEVEN_BIT_COMPRESSED: u8 = 0x40;

/// One protocol unit.
///
/// Frames are built with the `with_*` methods and treated as immutable once
/// handed to a transport. The wire has no way to carry an empty auth token:
/// a zero-length auth field always decodes to `None`, so `Some("")` is
/// stored as `None` when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    op: Operation,
    channel: u8,
    message_id: u32,
    auth: Option<String>,
    compressed: bool,
    payload: Vec<u8>,
    format: Format,
}

impl Frame {
    /// Create an empty frame on the control channel.
    pub fn new(op: Operation) -> Self {
        Self {
            op,
            channel: 0,
            message_id: 0,
            auth: None,
            compressed: false,
            payload: Vec::new(),
            format: Format::Regular,
        }
    }

    /// Create a tracked application message.
    pub fn message(
        channel: u8,
        message_id: u32,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, FrameError> {
        Ok(Self::new(Operation::Message)
            .with_channel(channel)?
            .with_message_id(message_id)
            .with_payload(payload))
    }

    /// Set the channel (0-63).
    pub fn with_channel(mut self, channel: u8) -> Result<Self, FrameError> {
        if channel > MAX_CHANNEL {
            return Err(FrameError::InvalidChannel(channel));
        }
        self.channel = channel;
        Ok(self)
    }

    /// Set the message id. Zero disables delivery tracking.
    pub fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id = message_id;
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Flag the payload for compression on the wire.
    ///
    /// Compressed bodies are zstd frames. Peers expecting a deflate stream
    /// cannot read them, so only set this towards peers built on this crate.
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Set the wire format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Set the auth token.
    pub fn with_auth(mut self, auth: Option<String>) -> Result<Self, FrameError> {
        self.set_auth(auth)?;
        Ok(self)
    }

    /// Replace the auth token. An empty string clears it, since it would
    /// decode as absent anyway.
    pub fn set_auth(&mut self, auth: Option<String>) -> Result<(), FrameError> {
        let auth = auth.filter(|a| !a.is_empty());
        if let Some(token) = &auth {
            validate_auth(token.as_bytes())?;
        }
        self.auth = auth;
        Ok(())
    }

    /// Replace the wire format.
    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Operation code.
    pub fn operation(&self) -> Operation {
        self.op
    }

    /// Channel id.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Message id.
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Auth token, if any.
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    /// Whether the payload travels compressed.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Payload bytes (uncompressed).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Wire format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Encode to wire bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, FrameError> {
        let body = if self.compressed {
            compress(&self.payload)?
        } else {
            self.payload.clone()
        };
        let auth = self.auth.as_deref().unwrap_or("").as_bytes();
        if auth.len() > MAX_AUTH_LEN {
            return Err(FrameError::AuthTooLong(auth.len()));
        }

        let (header, body) = match self.format {
            Format::Regular => {
                if body.len() > u32::MAX as usize {
                    return Err(FrameError::PayloadTooLarge {
                        size: body.len(),
                        limit: u32::MAX as usize,
                    });
                }
                (self.regular_header(auth.len(), body.len()), body)
            }
            Format::SevenBit => {
                let body = septet::pack(&body);
                if body.len() > MAX_SEVEN_BIT_LEN {
                    return Err(FrameError::PayloadTooLarge {
                        size: body.len(),
                        limit: MAX_SEVEN_BIT_LEN,
                    });
                }
                (self.seven_bit_header(auth.len(), body.len()), body)
            }
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + auth.len() + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(auth);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn regular_header(&self, auth_len: usize, body_len: usize) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h[0] = REGULAR_MARKER | self.op.as_byte();
        if self.compressed {
            h[1] = REGULAR_COMPRESSED;
        }
        h[2..4].copy_from_slice(&(auth_len as u16).to_be_bytes());
        h[4..8].copy_from_slice(&self.message_id.to_be_bytes());
        h[9] = self.channel;
        h[12..16].copy_from_slice(&(body_len as u32).to_be_bytes());
        h
    }

    fn seven_bit_header(&self, auth_len: usize, body_len: usize) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h[0] = self.op.as_byte();
        h[1] = ((auth_len >> 14) & 0x03) as u8;
        if self.compressed {
            h[1] |= SEVEN_BIT_COMPRESSED;
        }
        h[2] = ((auth_len >> 7) & 0x7F) as u8;
        h[3] = (auth_len & 0x7F) as u8;
        h[4..8].copy_from_slice(&septet::encode_u28(self.message_id));
        h[8] = (self.message_id >> 28) as u8;
        h[9] = self.channel;
        h[12..16].copy_from_slice(&septet::encode_u28(body_len as u32));
        h
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while `buf` does not yet hold a complete frame, and
    /// `Ok(Some((frame, consumed)))` once it does. Nothing is consumed on
    /// failure. An unknown operation code fails as soon as the header is in.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE]
            .try_into()
            .map_err(|_| FrameError::MalformedHeader(buf[0]))?;

        let lead = header[0];
        let format = match lead & MARKER_MASK {
            REGULAR_MARKER => Format::Regular,
            0x00 => Format::SevenBit,
            _ => return Err(FrameError::MalformedHeader(lead)),
        };
        let op = Operation::try_from(lead & !MARKER_MASK)?;

        let fields = match format {
            Format::Regular => parse_regular(header),
            Format::SevenBit => parse_seven_bit(header)?,
        };
        if fields.channel > MAX_CHANNEL {
            return Err(FrameError::InvalidChannel(fields.channel));
        }

        let total = HEADER_SIZE
            .checked_add(fields.auth_len)
            .and_then(|n| n.checked_add(fields.body_len))
            .ok_or(FrameError::PayloadTooLarge {
                size: fields.body_len,
                limit: usize::MAX - HEADER_SIZE - fields.auth_len,
            })?;
        if buf.len() < total {
            return Ok(None);
        }

        let auth_end = HEADER_SIZE + fields.auth_len;
        let auth_bytes = &buf[HEADER_SIZE..auth_end];
        validate_auth(auth_bytes)?;
        let auth = if auth_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(auth_bytes).into_owned())
        };

        let body = &buf[auth_end..total];
        let body = match format {
            Format::Regular => body.to_vec(),
            Format::SevenBit => septet::unpack(body)?,
        };
        let payload = if fields.compressed {
            decompress(&body)?
        } else {
            body
        };

        Ok(Some((
            Frame {
                op,
                channel: fields.channel,
                message_id: fields.message_id,
                auth,
                compressed: fields.compressed,
                payload,
                format,
            },
            total,
        )))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/C{}/{}/{}",
            self.op,
            self.channel,
            self.message_id,
            self.payload.len()
        )
    }
}

struct HeaderFields {
    compressed: bool,
    auth_len: usize,
    message_id: u32,
    channel: u8,
    body_len: usize,
}

fn parse_regular(h: &[u8; HEADER_SIZE]) -> HeaderFields {
    HeaderFields {
        compressed: h[1] & REGULAR_COMPRESSED != 0,
        auth_len: usize::from(u16::from_be_bytes([h[2], h[3]])),
        message_id: u32::from_be_bytes([h[4], h[5], h[6], h[7]]),
        channel: h[9],
        body_len: u32::from_be_bytes([h[12], h[13], h[14], h[15]]) as usize,
    }
}

fn parse_seven_bit(h: &[u8; HEADER_SIZE]) -> Result<HeaderFields, FrameError> {
    if let Some(&bad) = h.iter().find(|b| **b > 0x7F) {
        return Err(FrameError::NotSevenBitClean(bad));
    }
    let auth_len =
        (usize::from(h[1] & 0x03) << 14) | (usize::from(h[2]) << 7) | usize::from(h[3]);
    let low = septet::decode_u28(&[h[4], h[5], h[6], h[7]]);
    Ok(HeaderFields {
        compressed: h[1] & SEVEN_BIT_COMPRESSED != 0,
        auth_len,
        message_id: (u32::from(h[8] & 0x0F) << 28) | low,
        channel: h[9],
        body_len: septet::decode_u28(&[h[12], h[13], h[14], h[15]]) as usize,
    })
}

fn validate_auth(bytes: &[u8]) -> Result<(), FrameError> {
    if bytes.len() > MAX_AUTH_LEN {
        return Err(FrameError::AuthTooLong(bytes.len()));
    }
    if bytes.iter().all(|b| (0x20..=0x7F).contains(b)) {
        Ok(())
    } else {
        Err(FrameError::InvalidAuth)
    }
}

#[cfg(feature = "compression")]
fn compress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    Ok(crate::extensions::Compressor::new().compress(data)?)
}

#[cfg(feature = "compression")]
fn decompress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    Ok(crate::extensions::Compressor::new().decompress(data)?)
}

#[cfg(not(feature = "compression"))]
fn compress(_data: &[u8]) -> Result<Vec<u8>, FrameError> {
    Err(FrameError::CompressionUnavailable)
}

#[cfg(not(feature = "compression"))]
fn decompress(_data: &[u8]) -> Result<Vec<u8>, FrameError> {
    Err(FrameError::CompressionUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Frame {
        Frame::message(5, 0xDEAD_BEEF, b"hello".to_vec())
            .unwrap()
            .with_auth(Some("token-1".into()))
            .unwrap()
    }

    #[test]
    fn test_regular_header_layout() {
        let bytes = sample().serialize().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 7 + 5);
        assert_eq!(bytes[0], 0x80 | 8);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[2..4], &[0, 7]);
        assert_eq!(&bytes[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bytes[8], 0);
        assert_eq!(bytes[9], 5);
        assert_eq!(&bytes[10..12], &[0, 0]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 5]);
        assert_eq!(&bytes[16..23], b"token-1");
        assert_eq!(&bytes[23..], b"hello");
    }

    #[test]
    fn test_decode_roundtrip() {
        let frame = sample();
        let bytes = frame.serialize().unwrap();
        let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_absent_and_empty_auth_decode_as_none() {
        let frame = Frame::new(Operation::Ok).with_auth(Some(String::new())).unwrap();
        assert_eq!(frame.auth(), None);
        let bytes = frame.serialize().unwrap();
        let (decoded, _) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded.auth(), None);

        let mut signed = Frame::new(Operation::Ok)
            .with_auth(Some("T1".to_string()))
            .unwrap();
        signed.set_auth(Some(String::new())).unwrap();
        assert_eq!(signed.auth(), None);
        assert_eq!(signed.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_short_buffer_needs_more() {
        let bytes = sample().serialize().unwrap();
        assert!(Frame::decode(&bytes[..10]).unwrap().is_none());
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
        assert!(Frame::decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut bytes = sample().serialize().unwrap();
        let first = bytes.len();
        bytes.extend_from_slice(&Frame::new(Operation::Ping).serialize().unwrap()[..4]);
        let (_, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, first);
        assert!(Frame::decode(&bytes[used..]).unwrap().is_none());
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let mut bytes = Frame::new(Operation::Ok).serialize().unwrap();
        bytes[0] = 0x80 | 7;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::UnknownOperation(7))
        ));
        bytes[0] = 0x80;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::UnknownOperation(0))
        ));
    }

    #[test]
    fn test_bad_marker_rejected() {
        let mut bytes = Frame::new(Operation::Ok).serialize().unwrap();
        bytes[0] = 0xC0 | 16;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_invalid_channel() {
        assert!(matches!(
            Frame::new(Operation::Message).with_channel(64),
            Err(FrameError::InvalidChannel(64))
        ));
        let mut bytes = Frame::new(Operation::Message).serialize().unwrap();
        bytes[9] = 70;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::InvalidChannel(70))
        ));
    }

    #[test]
    fn test_non_printable_auth_rejected() {
        assert!(matches!(
            Frame::new(Operation::Ok).with_auth(Some("tab\there".into())),
            Err(FrameError::InvalidAuth)
        ));
    }

    #[test]
    fn test_seven_bit_layout_is_ascii() {
        let frame = sample()
            .with_message_id(u32::MAX)
            .with_payload(vec![0xFF; 33])
            .with_format(Format::SevenBit);
        let bytes = frame.serialize().unwrap();
        assert!(bytes.iter().all(|b| *b <= 0x7F));
        assert_eq!(bytes[0], 8);
        let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_seven_bit_rejects_high_header_byte() {
        let mut bytes = Frame::new(Operation::Ok)
            .with_format(Format::SevenBit)
            .serialize()
            .unwrap();
        bytes[5] = 0x81;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(FrameError::NotSevenBitClean(0x81))
        ));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_compressed_payload() {
        let payload = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabc".repeat(10);
        for format in [Format::Regular, Format::SevenBit] {
            let frame = Frame::message(1, 9, payload.clone())
                .unwrap()
                .with_compressed(true)
                .with_format(format);
            let bytes = frame.serialize().unwrap();
            assert!(bytes.len() < HEADER_SIZE + payload.len());
            let (decoded, _) = Frame::decode(&bytes).unwrap().unwrap();
            assert!(decoded.is_compressed());
            assert_eq!(decoded.payload(), &payload[..]);
        }

        // Regular bodies carry the zstd frame magic verbatim.
        let bytes = Frame::message(1, 9, payload)
            .unwrap()
            .with_compressed(true)
            .serialize()
            .unwrap();
        assert!(bytes.windows(4).any(|w| w == [0x28, 0xB5, 0x2F, 0xFD]));
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        (
            prop::sample::select(Operation::ALL.to_vec()),
            0u8..=MAX_CHANNEL,
            any::<u32>(),
            prop::option::of("[ -~]{1,40}"),
            prop::collection::vec(any::<u8>(), 0..300),
            prop_oneof![Just(Format::Regular), Just(Format::SevenBit)],
        )
            .prop_map(|(op, channel, id, auth, payload, format)| {
                Frame::new(op)
                    .with_channel(channel)
                    .unwrap()
                    .with_message_id(id)
                    .with_auth(auth)
                    .unwrap()
                    .with_payload(payload)
                    .with_format(format)
            })
    }

    proptest! {
        #[test]
        fn prop_roundtrip_both_formats(frame in arb_frame()) {
            let bytes = frame.serialize().unwrap();
            if frame.format() == Format::SevenBit {
                prop_assert!(bytes.iter().all(|b| *b <= 0x7F));
            }
            let (decoded, used) = Frame::decode(&bytes).unwrap().unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn prop_split_delivery(frame in arb_frame(), split in any::<prop::sample::Index>()) {
            let bytes = frame.serialize().unwrap();
            let at = split.index(bytes.len() + 1);

            let mut acc = bytes[..at].to_vec();
            if at < bytes.len() {
                prop_assert!(Frame::decode(&acc).unwrap().is_none());
            }
            acc.extend_from_slice(&bytes[at..]);
            let (decoded, used) = Frame::decode(&acc).unwrap().unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert_eq!(decoded, frame);
        }
    }
}
