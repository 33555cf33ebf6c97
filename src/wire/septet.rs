//! 7-bit packing used by the 7-bit-safe format.
//!
//! Integers are split into 7-bit groups, most significant first. Payloads
//! are treated as a bit stream and re-cut into 7-bit units, so `n` bytes
//! become `ceil(8n / 7)` septets and decode back to exactly `n` bytes.

use super::FrameError;

/// Encode the low 28 bits of `value` as four septets.
pub fn encode_u28(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        (value & 0x7F) as u8,
    ]
}

/// Decode four septets into a 28-bit value.
pub fn decode_u28(bytes: &[u8; 4]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| (acc << 7) | u32::from(b & 0x7F))
}

/// Septets needed to carry `len` payload bytes.
pub fn packed_len(len: usize) -> usize {
    (len * 8).div_ceil(7)
}

/// Payload bytes carried by `len` septets.
pub fn unpacked_len(len: usize) -> usize {
    len * 7 / 8
}

/// Re-cut `data` into 7-bit units. The final septet is zero-padded.
pub fn pack(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packed_len(data.len()));
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    for &b in data {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 7 {
            bits -= 7;
            out.push(((acc >> bits) & 0x7F) as u8);
        }
        acc &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(((acc << (7 - bits)) & 0x7F) as u8);
    }
    out
}

/// Reverse [`pack`]. Fails on any byte above 0x7F.
pub fn unpack(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(unpacked_len(data.len()));
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    for &s in data {
        if s > 0x7F {
            return Err(FrameError::NotSevenBitClean(s));
        }
        acc = (acc << 7) | u32::from(s);
        bits += 7;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u28_roundtrip() {
        for v in [0u32, 1, 127, 128, 0x3FFF, 0x0ABC_DEF0 & 0x0FFF_FFFF, 0x0FFF_FFFF] {
            let enc = encode_u28(v);
            assert!(enc.iter().all(|b| *b <= 0x7F));
            assert_eq!(decode_u28(&enc), v);
        }
    }

    #[test]
    fn test_u28_truncates_high_bits() {
        assert_eq!(decode_u28(&encode_u28(0xF000_0001)), 1);
    }

    #[test]
    fn test_packed_lengths() {
        assert_eq!(packed_len(0), 0);
        assert_eq!(packed_len(1), 2);
        assert_eq!(packed_len(7), 8);
        assert_eq!(packed_len(8), 10);
        for n in 0..64 {
            assert_eq!(unpacked_len(packed_len(n)), n);
        }
    }

    #[test]
    fn test_pack_high_bytes() {
        let data = [0xFFu8, 0x80, 0x00, 0x7F, 0xAA, 0x55, 0x01, 0xFE];
        let packed = pack(&data);
        assert_eq!(packed.len(), packed_len(data.len()));
        assert!(packed.iter().all(|b| *b <= 0x7F));
        assert_eq!(unpack(&packed).unwrap(), data);
    }

    #[test]
    fn test_unpack_rejects_high_byte() {
        assert!(matches!(
            unpack(&[0x10, 0x90]),
            Err(FrameError::NotSevenBitClean(0x90))
        ));
    }
}
