//! Big-endian framing helpers for the index format.

use crate::error::{ColumnarError, ColumnarResult};

/// Bounds-checked cursor over a byte slice.
pub(crate) struct Frame<'a> {
    data: &'a [u8],
    pos: usize,
    file: &'static str,
}

impl<'a> Frame<'a> {
    pub fn new(data: &'a [u8], file: &'static str) -> Self {
        Self { data, pos: 0, file }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> ColumnarResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(ColumnarError::corrupt(
                self.file,
                format!("truncated at offset {}: need {n} bytes", self.pos),
            ));
        }
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> ColumnarResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u32(&mut self) -> ColumnarResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> ColumnarResult<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    /// Check a four-byte magic followed by a `u32` version.
    pub fn expect_header(&mut self, magic: &[u8; 4], version: u32) -> ColumnarResult<()> {
        let actual = self.take(4)?;
        if actual != magic {
            return Err(ColumnarError::InvalidMagic {
                file: self.file.into(),
                expected: String::from_utf8_lossy(magic).into(),
                actual: String::from_utf8_lossy(actual).into(),
            });
        }
        let found = self.u32()?;
        if found != version {
            return Err(ColumnarError::UnsupportedVersion {
                file: self.file.into(),
                version: found,
            });
        }
        Ok(())
    }
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Verify a trailing BLAKE3 checksum; returns the body before it.
pub(crate) fn check_trailer<'a>(data: &'a [u8], file: &'static str) -> ColumnarResult<&'a [u8]> {
    if data.len() < 32 {
        return Err(ColumnarError::corrupt(file, "missing checksum"));
    }
    let (body, trailer) = data.split_at(data.len() - 32);
    if blake3::hash(body).as_bytes() != trailer {
        return Err(ColumnarError::corrupt(file, "checksum mismatch"));
    }
    Ok(body)
}
