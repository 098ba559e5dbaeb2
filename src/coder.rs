use crate::result::{QuicError, QuicResult};
use crate::varint::VarInt;

/// Types with a context-free wire form.
pub trait Coder: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(r: &mut Reader<'_>) -> QuicResult<Self>;
}

/// Forward-only cursor over a received buffer. Every accessor checks the
/// remaining length, so parse code can rely on `?` instead of slicing math.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn peek_u8(&self) -> QuicResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(QuicError::InsufficientData("byte"))
    }

    pub fn u8(&mut self) -> QuicResult<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u16(&mut self) -> QuicResult<u16> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    pub fn u32(&mut self) -> QuicResult<u32> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    pub fn bytes(&mut self, n: usize) -> QuicResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(QuicError::InsufficientData("bytes"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn array<const N: usize>(&mut self) -> QuicResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// Remaining bytes, consuming them all.
    pub fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }

    pub fn varint(&mut self) -> QuicResult<VarInt> {
        VarInt::decode(self)
    }

    /// Varint narrowed to usize, for length prefixes.
    pub fn varint_len(&mut self) -> QuicResult<usize> {
        Ok(self.varint()?.usize())
    }

    pub fn skip(&mut self, n: usize) -> QuicResult<()> {
        self.bytes(n).map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reader_basics() {
        let data = [1u8, 2, 3, 4, 5];
        let mut r = Reader::new(&data);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.u16().unwrap(), 0x0203);
        assert_eq!(r.consumed(), 3);
        assert_eq!(r.bytes(2).unwrap(), &[4, 5]);
        assert!(r.is_empty());
        assert_eq!(r.u8(), Err(QuicError::InsufficientData("byte")));
    }

    #[test]
    fn test_reader_rest() {
        let data = [9u8, 8, 7];
        let mut r = Reader::new(&data);
        r.u8().unwrap();
        assert_eq!(r.rest(), &[8, 7]);
        assert!(r.is_empty());
    }
}
