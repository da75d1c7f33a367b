//! Non-owning cursor reader/writer over contiguous byte regions.

use super::error::{CodecError, Result};
use super::varint;

/// Read cursor over a borrowed byte region.
///
/// All accessors fail with [`CodecError::UnexpectedEnd`] instead of
/// panicking when the region is exhausted.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Wrap a byte region.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes still available.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the cursor is exhausted.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn check(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(CodecError::UnexpectedEnd {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Look at the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.check(1)?;
        Ok(self.buf[self.pos])
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = self.peek_u8()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16> {
        let span = self.read_span(2)?;
        Ok(u16::from_be_bytes(span.try_into().expect("length checked")))
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let span = self.read_span(4)?;
        Ok(u32::from_be_bytes(span.try_into().expect("length checked")))
    }

    /// Read a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        let span = self.read_span(8)?;
        Ok(u64::from_be_bytes(span.try_into().expect("length checked")))
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, consumed) = varint::decode_from(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(value)
    }

    /// Borrow the next `len` bytes.
    pub fn read_span(&mut self, len: usize) -> Result<&'a [u8]> {
        self.check(len)?;
        let span = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(span)
    }

    /// Borrow a varint-length-prefixed span.
    pub fn read_varint_span(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| CodecError::UnexpectedEnd {
            needed: usize::MAX,
            available: self.remaining(),
        })?;
        self.read_span(len)
    }

    /// Consume and borrow everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let span = &self.buf[self.pos..];
        self.pos = self.buf.len();
        span
    }

    /// Advance without looking at the bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.check(len)?;
        self.pos += len;
        Ok(())
    }
}

/// Write cursor over a borrowed mutable byte region.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    /// Wrap a mutable byte region.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes written so far.
    #[must_use]
    pub const fn written(&self) -> usize {
        self.pos
    }

    /// Number of bytes still writable.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn check(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(CodecError::UnexpectedEnd {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.check(1)?;
        self.buf[self.pos] = value;
        self.pos += 1;
        Ok(())
    }

    /// Write a big-endian u16.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_span(&value.to_be_bytes())
    }

    /// Write a big-endian u32.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_span(&value.to_be_bytes())
    }

    /// Write a big-endian u64.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_span(&value.to_be_bytes())
    }

    /// Write a variable-length integer in its minimal encoding.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let consumed = varint::encode_into(value, &mut self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(())
    }

    /// Copy a byte span.
    pub fn write_span(&mut self, span: &[u8]) -> Result<()> {
        self.check(span.len())?;
        self.buf[self.pos..self.pos + span.len()].copy_from_slice(span);
        self.pos += span.len();
        Ok(())
    }

    /// Write a varint length prefix followed by the span itself.
    pub fn write_varint_span(&mut self, span: &[u8]) -> Result<()> {
        self.write_varint(span.len() as u64)?;
        self.write_span(span)
    }

    /// View of everything written so far.
    #[must_use]
    pub fn as_written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}
