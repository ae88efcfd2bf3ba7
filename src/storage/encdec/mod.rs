pub mod decode;
pub mod encode;

use std::ops::Range;

use num_bigint::BigUint;

pub use decode::{DecodingError, DecodingResult, malformed_input};

pub trait Encode {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decode
where
    Self: Sized,
{
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self>;

    /// `decode` but ignoring, and not returning, any remaining bytes
    fn decode_all(bytes: &[u8]) -> Result<Self, DecodingError> {
        Self::decode(bytes).map(|x| x.0)
    }
}

#[derive(Default, Clone)]
pub struct EncodeBuilder {
    output: Vec<u8>,
}

impl EncodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<T: Encode>(mut self, data: &T) -> Self {
        self.output.extend(data.encode());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.output
    }
}

/// Maximum total size of a packed bigint: one length byte plus up to 240
/// bytes of big-endian magnitude.
pub const MAX_PACKED_BIGINT_BYTES: usize = 241;

/// Appends an unsigned integer as minimal little-endian base-128.
pub fn write_varuint(mut n: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn read_varuint(bytes: &[u8]) -> DecodingResult<'_, u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for (i, byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(DecodingError::VarintOverflow);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, &bytes[i + 1..]));
        }
        shift += 7;
    }

    Err(malformed_input("varuint insufficient bytes"))
}

/// Appends a signed integer as a zigzag varint: `2n` for `n >= 0`,
/// `2(-n) - 1` otherwise. One byte iff `|n| < 64`.
pub fn write_varint(n: i64, out: &mut Vec<u8>) {
    write_varuint(((n << 1) ^ (n >> 63)) as u64, out);
}

pub fn read_varint(bytes: &[u8]) -> DecodingResult<'_, i64> {
    let (raw, rest) = read_varuint(bytes)?;
    Ok((((raw >> 1) as i64) ^ -((raw & 1) as i64), rest))
}

/// Appends a non-negative bigint as one length byte followed by the
/// big-endian magnitude (no magnitude bytes for zero). Returns the number
/// of bytes written. A magnitude that does not fit writes nothing and
/// returns the sentinel `MAX_PACKED_BIGINT_BYTES + 1`.
pub fn write_bigint(value: &BigUint, out: &mut Vec<u8>) -> usize {
    let magnitude = if *value == BigUint::ZERO {
        Vec::new()
    } else {
        value.to_bytes_be()
    };

    if 1 + magnitude.len() > MAX_PACKED_BIGINT_BYTES {
        return MAX_PACKED_BIGINT_BYTES + 1;
    }

    out.push(magnitude.len() as u8);
    out.extend_from_slice(&magnitude);
    1 + magnitude.len()
}

pub fn read_bigint(bytes: &[u8]) -> DecodingResult<'_, BigUint> {
    let len = *bytes
        .first()
        .ok_or(malformed_input("bigint insufficient bytes"))? as usize;

    if 1 + len > MAX_PACKED_BIGINT_BYTES {
        return Err(DecodingError::BigintTooLong(len));
    }

    let (magnitude, rest) = bytes[1..]
        .split_at_checked(len)
        .ok_or(malformed_input("bigint insufficient bytes"))?;

    Ok((BigUint::from_bytes_be(magnitude), rest))
}

pub fn prefix_key_range(prefix: &[u8]) -> Range<Vec<u8>> {
    let start = prefix.to_vec();
    let mut end = prefix.to_vec();

    // Work backwards to handle the case where the last byte(s) are 255
    for i in (0..end.len()).rev() {
        if end[i] != 255 {
            end[i] += 1;
            end.truncate(i + 1);
            return start..end;
        }
    }

    // If all bytes are 255, the range is unbounded at the upper end
    start..vec![]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_one_byte_boundary() {
        for n in [-64i64, -1, 0, 1, 63] {
            let mut buf = Vec::new();
            write_varint(n, &mut buf);
            assert_eq!(buf.len(), 1, "expected 1 byte for {n}");
        }
        for n in [-65i64, 64, i64::MIN, i64::MAX] {
            let mut buf = Vec::new();
            write_varint(n, &mut buf);
            assert!(buf.len() > 1, "expected multi-byte encoding for {n}");
        }
    }

    #[test]
    fn bigint_fixtures() {
        // 123_456_789_123_456_789_012_345 round-trips
        let big: BigUint = "123456789123456789012345".parse().unwrap();
        let mut buf = Vec::new();
        let written = write_bigint(&big, &mut buf);
        assert_eq!(written, buf.len());
        assert_eq!(buf[0] as usize, buf.len() - 1);
        let (back, rest) = read_bigint(&buf).unwrap();
        assert_eq!(back, big);
        assert!(rest.is_empty());

        // zero packs to a single zero length byte
        let mut buf = Vec::new();
        assert_eq!(write_bigint(&BigUint::ZERO, &mut buf), 1);
        assert_eq!(buf, vec![0]);
        assert_eq!(read_bigint(&buf).unwrap().0, BigUint::ZERO);
    }

    #[test]
    fn bigint_over_maximum_returns_sentinel() {
        let huge = BigUint::from(2u32).pow(8 * 240); // magnitude of 241 bytes
        let mut buf = Vec::new();
        assert_eq!(write_bigint(&huge, &mut buf), MAX_PACKED_BIGINT_BYTES + 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn bigint_rejects_overlong_length_byte() {
        let mut bytes = vec![241u8];
        bytes.extend(std::iter::repeat_n(0xab, 241));
        assert!(matches!(
            read_bigint(&bytes),
            Err(DecodingError::BigintTooLong(241))
        ));
    }

    #[test]
    fn truncated_inputs_are_refused() {
        assert!(read_varuint(&[]).is_err());
        assert!(read_varuint(&[0x80]).is_err());
        assert!(read_bigint(&[5, 1, 2]).is_err());
    }

    #[test]
    fn prefix_ranges() {
        assert_eq!(prefix_key_range(&[1, 2]), vec![1, 2]..vec![1, 3]);
        assert_eq!(prefix_key_range(&[1, 255]), vec![1, 255]..vec![2]);
        assert_eq!(prefix_key_range(&[255, 255]), vec![255, 255]..vec![]);
    }

    proptest! {
        #[test]
        fn varuint_round_trip(n in any::<u64>()) {
            let mut buf = Vec::new();
            write_varuint(n, &mut buf);
            let (back, rest) = read_varuint(&buf).unwrap();
            prop_assert_eq!(back, n);
            prop_assert!(rest.is_empty());
        }

        #[test]
        fn varint_round_trip(n in any::<i64>()) {
            let mut buf = Vec::new();
            write_varint(n, &mut buf);
            let (back, rest) = read_varint(&buf).unwrap();
            prop_assert_eq!(back, n);
            prop_assert!(rest.is_empty());
        }

        #[test]
        fn varint_single_byte_iff_small(n in -200i64..200) {
            let mut buf = Vec::new();
            write_varint(n, &mut buf);
            prop_assert_eq!(buf.len() == 1, n.abs() < 64);
        }

        #[test]
        fn bigint_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..240)) {
            let value = BigUint::from_bytes_be(&bytes);
            let mut buf = Vec::new();
            let written = write_bigint(&value, &mut buf);
            prop_assert_eq!(written, buf.len());
            let (back, rest) = read_bigint(&buf).unwrap();
            prop_assert_eq!(back, value);
            prop_assert!(rest.is_empty());
        }
    }
}
