use super::{Encode, write_varint, write_varuint};

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl Encode for u8 {
    fn encode(&self) -> Vec<u8> {
        vec![*self]
    }
}

impl Encode for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Encode for u32 {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        write_varuint(*self as u64, &mut out);
        out
    }
}

impl Encode for u64 {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        write_varuint(*self, &mut out);
        out
    }
}

impl Encode for i64 {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        write_varint(*self, &mut out);
        out
    }
}

impl Encode for String {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.len());
        write_varuint(self.len() as u64, &mut out);
        out.extend_from_slice(self.as_bytes());
        out
    }
}

/// Length-prefixed byte string.
impl Encode for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.len());
        write_varuint(self.len() as u64, &mut out);
        out.extend_from_slice(self);
        out
    }
}

impl<A: Encode> Encode for Option<A> {
    fn encode(&self) -> Vec<u8> {
        match self {
            None => vec![0],
            Some(inner) => {
                let mut out = vec![1];
                out.extend(inner.encode());
                out
            }
        }
    }
}
