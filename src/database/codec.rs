//! Little-endian byte cursor and writer for the container format
//!
//! Every read is bounds-checked and fails with `InvalidFormat` instead of
//! reading past the end.

use zeroize::Zeroizing;

use crate::error::{DbError, Result};

/// Read cursor over an immutable byte slice
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Everything not yet consumed
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(DbError::format(format!(
                "truncated data: need {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// `len:u32` followed by that many bytes
    pub fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }
}

/// Append-only writer whose buffer is wiped on drop
///
/// Growing the buffer moves the contents into a larger allocation and wipes
/// the old one, so no stale copy is left behind in freed memory.
pub(crate) struct ByteWriter {
    buf: Zeroizing<Vec<u8>>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Zeroizing::new(Vec::with_capacity(capacity)),
        }
    }

    fn reserve(&mut self, additional: usize) {
        let needed = self.buf.len() + additional;
        if needed <= self.buf.capacity() {
            return;
        }
        let mut grown = Zeroizing::new(Vec::with_capacity(needed.max(self.buf.capacity() * 2).max(64)));
        grown.extend_from_slice(&self.buf);
        // the old buffer is zeroized on drop
        self.buf = grown;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.reserve(1);
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.put_bytes(&value.to_le_bytes());
    }

    /// Write `len:u32 ‖ bytes`
    pub fn put_len_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_u32(checked_len(bytes.len())?);
        self.put_bytes(bytes);
        Ok(())
    }

    pub fn into_inner(self) -> Zeroizing<Vec<u8>> {
        self.buf
    }
}

/// Length as stored in a `u32` field
pub(crate) fn checked_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| DbError::InvalidOperation(format!("value too large: {} bytes", len)))
}
