//! Zero-copy cursor helpers for [`bytes::Bytes`] buffers.
//!
//! Parsers in this workspace keep payloads in `Bytes` and walk them with
//! `std::io::Cursor`. The standard `Read` impl copies into caller buffers;
//! [`BytesCursorExt`] instead slices the underlying buffer, so extracting a
//! payload is a reference-count bump rather than a memcpy.

use std::io;

use bytes::Bytes;

/// Extension methods for `Cursor<Bytes>` that extract sub-slices without
/// copying.
pub trait BytesCursorExt {
    /// Extract `size` bytes at the current position and advance past them.
    ///
    /// Returns `UnexpectedEof` if fewer than `size` bytes remain.
    fn extract_bytes(&mut self, size: usize) -> io::Result<Bytes>;

    /// Extract all bytes from the current position to the end of the buffer.
    fn extract_remaining(&mut self) -> Bytes;

    /// Number of bytes between the current position and the end.
    fn remaining_len(&self) -> usize;
}

impl BytesCursorExt for io::Cursor<Bytes> {
    fn extract_bytes(&mut self, size: usize) -> io::Result<Bytes> {
        let start = usize::try_from(self.position())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "cursor position overflow"))?;
        let end = start.checked_add(size).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "requested slice overflows")
        })?;

        let data = self.get_ref();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "cannot extract {size} bytes, only {} remaining",
                    data.len().saturating_sub(start)
                ),
            ));
        }

        let slice = data.slice(start..end);
        self.set_position(end as u64);
        Ok(slice)
    }

    fn extract_remaining(&mut self) -> Bytes {
        let data = self.get_ref();
        let start = (self.position() as usize).min(data.len());
        let slice = data.slice(start..);
        self.set_position(data.len() as u64);
        slice
    }

    fn remaining_len(&self) -> usize {
        let data = self.get_ref();
        data.len().saturating_sub(self.position() as usize)
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bytes_advances_cursor() {
        let mut cursor = io::Cursor::new(Bytes::from_static(b"abcdef"));
        let head = cursor.extract_bytes(2).unwrap();
        assert_eq!(head.as_ref(), b"ab");
        assert_eq!(cursor.position(), 2);

        let mid = cursor.extract_bytes(3).unwrap();
        assert_eq!(mid.as_ref(), b"cde");
        assert_eq!(cursor.remaining_len(), 1);
    }

    #[test]
    fn test_extract_bytes_is_zero_copy() {
        let source = Bytes::from_static(b"0123456789");
        let mut cursor = io::Cursor::new(source.clone());
        let slice = cursor.extract_bytes(4).unwrap();
        // Same allocation, different range.
        assert_eq!(slice.as_ptr(), source.as_ptr());
    }

    #[test]
    fn test_extract_bytes_eof() {
        let mut cursor = io::Cursor::new(Bytes::from_static(b"ab"));
        let err = cursor.extract_bytes(3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // Cursor does not advance on failure.
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_extract_remaining() {
        let mut cursor = io::Cursor::new(Bytes::from_static(b"abcdef"));
        cursor.set_position(4);
        assert_eq!(cursor.extract_remaining().as_ref(), b"ef");
        assert_eq!(cursor.remaining_len(), 0);
        assert_eq!(cursor.extract_remaining().len(), 0);
    }

    #[test]
    fn test_extract_remaining_past_end() {
        let mut cursor = io::Cursor::new(Bytes::from_static(b"ab"));
        cursor.set_position(10);
        assert_eq!(cursor.extract_remaining().len(), 0);
    }
}
