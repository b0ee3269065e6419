//! Bounds-checked little-endian cursor over on-disk records.

use crate::error::{HksError, HksResult};

/// Reads fixed-width fields from a byte slice, failing instead of indexing past the end.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> HksResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(HksError::corrupt(format!(
                "field of {len} bytes at offset {} runs past end of {}-byte buffer",
                self.pos,
                self.buf.len()
            )));
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.buf[start..self.pos])
    }

    pub fn skip(&mut self, len: usize) -> HksResult<()> {
        self.take(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> HksResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> HksResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> HksResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_array<const N: usize>(&mut self) -> HksResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// Appends fixed-width little-endian fields to an owned buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Narrow a length to a fixed-width on-disk field.
pub fn to_u16(value: usize, what: &str) -> HksResult<u16> {
    u16::try_from(value).map_err(|_| HksError::invalid(format!("{what} {value} exceeds u16")))
}

pub fn to_u8(value: usize, what: &str) -> HksResult<u8> {
    u8::try_from(value).map_err(|_| HksError::invalid(format!("{what} {value} exceeds u8")))
}

pub fn to_u32(value: usize, what: &str) -> HksResult<u32> {
    u32::try_from(value).map_err(|_| HksError::invalid(format!("{what} {value} exceeds u32")))
}
