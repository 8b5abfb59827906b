#![forbid(unsafe_code)]
//! Varint and slice-reader utilities shared by the record codecs.

pub mod var {
    //! Unsigned LEB128 varints.

    use crate::types::{EnvError, Result};

    /// Maximum encoded length of a u64 varint.
    pub const MAX_LEN: usize = 10;

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes [`encode_u64`] emits for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - v.leading_zeros() as usize;
        bits.max(1).div_ceil(7)
    }

    /// Decodes a u64 varint from `src` at `*off`, advancing the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..MAX_LEN {
            let byte = *src
                .get(*off)
                .ok_or(EnvError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == MAX_LEN - 1 && payload > 1 {
                return Err(EnvError::Corruption("varint overflows u64"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(EnvError::Corruption("varint longer than 10 bytes"))
    }
}

pub mod buf {
    //! A slice-backed reader for parsing record payloads.

    use core::fmt;

    use super::var;
    use crate::types::{EnvError, Result};

    /// Reads bytes from a slice with offset tracking; every read is bounds-checked.
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Reader<'a> {
        /// Creates a reader starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(EnvError::Corruption("reader offset overflow"))?;
            if end > self.buf.len() {
                return Err(EnvError::Corruption("record payload truncated"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }

        /// Reads a varint and checks it fits in `usize`.
        pub fn varint_len(&mut self) -> Result<usize> {
            usize::try_from(self.varint()?).map_err(|_| EnvError::Corruption("length overflow"))
        }

        /// Reads a varint length prefix followed by that many bytes.
        pub fn prefixed(&mut self) -> Result<&'a [u8]> {
            let len = self.varint_len()?;
            self.take(len)
        }

        /// Reads a big-endian u64.
        pub fn u64_be(&mut self) -> Result<u64> {
            let bytes = self.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            Ok(u64::from_be_bytes(arr))
        }

        /// Reads a single byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Returns the number of unread bytes.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Fails unless every byte has been consumed.
        pub fn finish(&self) -> Result<()> {
            if self.remaining() != 0 {
                return Err(EnvError::Corruption("trailing bytes after record payload"));
            }
            Ok(())
        }
    }

    impl fmt::Debug for Reader<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Reader")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }

    /// Appends a varint length prefix and `bytes`.
    pub fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
        var::encode_u64(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }
}
