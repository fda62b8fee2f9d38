//! Byte buffer with a cursor: the primitive reads and writes the inventory codec is built on.
//!
//! Integers are little-endian. Strings are a LEB128 (7 bits per byte) length followed by
//! UTF-8 bytes.

/// Upper bound on a single string read off the wire.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Ordered binary buffer. Writes append at the end; reads advance the cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Package {
    data: Vec<u8>,
    pos: usize,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for reading, cursor at 0.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: bytes.into(),
            pos: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Absolute seek. Seeking to `len()` is allowed; beyond it is not.
    pub fn set_position(&mut self, pos: usize) -> Result<(), PackageError> {
        if pos > self.data.len() {
            return Err(PackageError::SeekOutOfRange {
                pos,
                len: self.data.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_str(&mut self, s: &str) {
        let mut len = s.len();
        loop {
            let byte = (len & 0x7f) as u8;
            len >>= 7;
            if len == 0 {
                self.data.push(byte);
                break;
            }
            self.data.push(byte | 0x80);
        }
        self.data.extend_from_slice(s.as_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Overwrite four bytes at `at` with `v`. Used to back-patch length fields.
    pub(crate) fn patch_i32(&mut self, at: usize, v: i32) -> Result<(), PackageError> {
        let len = self.data.len();
        let slot = self
            .data
            .get_mut(at..at + 4)
            .ok_or(PackageError::SeekOutOfRange { pos: at, len })?;
        slot.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32, PackageError> {
        Ok(i32::from_le_bytes(self.take::<4>()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, PackageError> {
        Ok(u32::from_le_bytes(self.take::<4>()?))
    }

    pub fn read_string(&mut self) -> Result<String, PackageError> {
        let len = self.read_length_prefix()?;
        if len > MAX_STRING_LEN {
            return Err(PackageError::StringTooLong(len));
        }
        if self.remaining() < len {
            return Err(PackageError::UnexpectedEnd {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        String::from_utf8(bytes).map_err(|_| PackageError::InvalidUtf8)
    }

    fn read_length_prefix(&mut self) -> Result<usize, PackageError> {
        let mut value: usize = 0;
        // At most five groups of seven bits fit a 32-bit length.
        for shift in (0..35).step_by(7) {
            let [byte] = self.take::<1>()?;
            value |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(PackageError::BadLengthPrefix)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], PackageError> {
        if self.remaining() < N {
            return Err(PackageError::UnexpectedEnd {
                needed: N,
                remaining: self.remaining(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PackageError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("seek to {pos} past end of {len}-byte buffer")]
    SeekOutOfRange { pos: usize, len: usize },
    #[error("string length prefix is malformed")]
    BadLengthPrefix,
    #[error("string of {0} bytes exceeds limit")]
    StringTooLong(usize),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}
