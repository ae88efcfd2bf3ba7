use thiserror::Error;

use super::{Decode, read_varint, read_varuint};

#[derive(Debug, Clone, Error)]
pub enum DecodingError {
    #[error("malformed input: {0}")]
    MalformedInput(&'static str),

    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("value out of range: {0}")]
    OutOfRange(i64),

    #[error("packed bigint length {0} exceeds maximum")]
    BigintTooLong(usize),
}

pub fn malformed_input(msg: &'static str) -> DecodingError {
    DecodingError::MalformedInput(msg)
}

pub type DecodingResult<'a, T> = Result<(T, &'a [u8]), DecodingError>;

impl<const N: usize> Decode for [u8; N] {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (head, rest) = bytes
            .split_at_checked(N)
            .ok_or(malformed_input("array insufficient bytes"))?;

        // split_at_checked guarantees the length
        let array = head.try_into().map_err(|_| malformed_input("array"))?;

        Ok((array, rest))
    }
}

impl Decode for u8 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        bytes
            .first()
            .map(|b| (*b, &bytes[1..]))
            .ok_or(malformed_input("u8 insufficient bytes"))
    }
}

impl Decode for bool {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (byte, rest) = u8::decode(bytes)?;
        match byte {
            0 => Ok((false, rest)),
            1 => Ok((true, rest)),
            _ => Err(malformed_input("invalid bool byte")),
        }
    }
}

impl Decode for u32 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (raw, rest) = read_varuint(bytes)?;
        let value = u32::try_from(raw).map_err(|_| DecodingError::OutOfRange(raw as i64))?;
        Ok((value, rest))
    }
}

impl Decode for u64 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        read_varuint(bytes)
    }
}

impl Decode for i64 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        read_varint(bytes)
    }
}

impl Decode for String {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (raw, rest) = Vec::<u8>::decode(bytes)?;
        Ok((String::from_utf8(raw)?, rest))
    }
}

impl Decode for Vec<u8> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (len, rest) = read_varuint(bytes)?;
        let (head, rest) = rest
            .split_at_checked(len as usize)
            .ok_or(malformed_input("byte string insufficient bytes"))?;
        Ok((head.to_vec(), rest))
    }
}

impl<A: Decode> Decode for Option<A> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (tag, rest) = u8::decode(bytes)?;
        match tag {
            0 => Ok((None, rest)),
            1 => {
                let (inner, rest) = A::decode(rest)?;
                Ok((Some(inner), rest))
            }
            _ => Err(malformed_input("invalid option tag")),
        }
    }
}
