//! Low-level box header decoding and in-memory box walking.
//!
//! Two layers share these helpers: the top-level scan reads headers straight
//! from a [`demux::ByteSource`], while structural boxes (`moov`, `moof`,
//! `sidx`) are pulled fully into `Bytes` and walked by range.

use bytes::Bytes;

use demux::{ByteSource, DemuxError, Result};

use crate::fourcc::FourCc;

/// Maximum payload for any single non-`mdat` box. Corrupt size fields would
/// otherwise drive unbounded allocation.
pub const BOX_SIZE_CEILING: u64 = 64 * 1024 * 1024;

/// Decoded box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub fourcc: FourCc,
    /// Total box size including the header. Zero means "extends to the end
    /// of the stream" and is only legal at the top level.
    pub size: u64,
    pub header_len: u64,
}

impl BoxHeader {
    pub fn extends_to_end(&self) -> bool {
        self.size == 0
    }

    pub fn payload_len(&self) -> u64 {
        self.size.saturating_sub(self.header_len)
    }
}

/// Decode a box header from a byte slice. Returns `None` when fewer than the
/// required header bytes are present.
pub fn decode_header(data: &[u8]) -> Option<BoxHeader> {
    if data.len() < 8 {
        return None;
    }
    let size32 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let fourcc = FourCc([data[4], data[5], data[6], data[7]]);

    if size32 == 1 {
        if data.len() < 16 {
            return None;
        }
        let size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some(BoxHeader {
            fourcc,
            size,
            header_len: 16,
        })
    } else {
        Some(BoxHeader {
            fourcc,
            size: size32 as u64,
            header_len: 8,
        })
    }
}

/// Read a box header at `offset` from a byte source.
///
/// Returns `Ok(None)` at end of stream (fewer than 8 bytes remain).
pub fn read_header_at(source: &dyn ByteSource, offset: u64) -> Result<Option<BoxHeader>> {
    let mut head = [0u8; 16];
    let mut filled = 0;
    while filled < head.len() {
        let n = source.read_at(offset + filled as u64, &mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled < 8 {
        return Ok(None);
    }
    match decode_header(&head[..filled]) {
        Some(header) => Ok(Some(header)),
        // size == 1 but the extended size is cut off.
        None => Err(DemuxError::malformed("truncated extended box size")),
    }
}

/// A box located within an in-memory byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxView {
    pub fourcc: FourCc,
    pub start: usize,
    pub end: usize,
    pub body_start: usize,
    pub body_end: usize,
}

impl BoxView {
    pub fn body<'a>(&self, data: &'a Bytes) -> &'a [u8] {
        &data[self.body_start..self.body_end]
    }

    pub fn body_bytes(&self, data: &Bytes) -> Bytes {
        data.slice(self.body_start..self.body_end)
    }
}

/// Iterator over sibling boxes within `[start..end)` of an in-memory buffer.
///
/// Enforces the structural invariants: a child's declared range must nest
/// within the parent's, and the cursor must strictly advance each step. A
/// size of zero below the top level is skipped four bytes at a time rather
/// than rejected (some malformed producers emit it).
pub struct BoxWalker<'a> {
    data: &'a Bytes,
    offset: usize,
    end: usize,
}

impl<'a> BoxWalker<'a> {
    pub fn new(data: &'a Bytes, start: usize, end: usize) -> Self {
        Self {
            data,
            offset: start,
            end: end.min(data.len()),
        }
    }

    pub fn over(data: &'a Bytes) -> Self {
        Self::new(data, 0, data.len())
    }
}

impl Iterator for BoxWalker<'_> {
    type Item = Result<BoxView>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset < self.end {
            if self.end - self.offset < 8 {
                // Trailing sub-header garbage; stop rather than loop.
                return None;
            }
            let Some(header) = decode_header(&self.data[self.offset..self.end]) else {
                return Some(Err(DemuxError::malformed("truncated extended box size")));
            };

            if header.size == 0 {
                // Zero-size below top level: 4-byte skip, not an error.
                self.offset += 4;
                continue;
            }
            if header.size < header.header_len {
                return Some(Err(DemuxError::malformed(format!(
                    "box `{}` size {} smaller than its header",
                    header.fourcc, header.size
                ))));
            }
            let box_end = self.offset as u64 + header.size;
            if box_end > self.end as u64 {
                return Some(Err(DemuxError::malformed(format!(
                    "box `{}` overruns its parent range",
                    header.fourcc
                ))));
            }

            let view = BoxView {
                fourcc: header.fourcc,
                start: self.offset,
                end: box_end as usize,
                body_start: self.offset + header.header_len as usize,
                body_end: box_end as usize,
            };
            self.offset = view.end;
            return Some(Ok(view));
        }
        None
    }
}

/// Find the first direct child with `tag` inside `[start..end)`.
pub fn find_child(data: &Bytes, start: usize, end: usize, tag: FourCc) -> Result<Option<BoxView>> {
    for child in BoxWalker::new(data, start, end) {
        let child = child?;
        if child.fourcc == tag {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

/// Pull a box's full payload into memory, enforcing the size ceiling.
pub fn load_payload(source: &dyn ByteSource, offset: u64, header: &BoxHeader) -> Result<Bytes> {
    let payload_len = header.payload_len();
    if payload_len > BOX_SIZE_CEILING {
        return Err(DemuxError::malformed(format!(
            "box `{}` payload of {payload_len} bytes exceeds the size ceiling",
            header.fourcc
        )));
    }
    demux::read_bytes_at(source, offset + header.header_len, payload_len as usize)
}

/// Version and flags of a "full box".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullBoxHeader {
    pub version: u8,
    pub flags: u32,
}

/// Split a full-box body into its (version, flags) header and payload.
pub fn full_box(body: &[u8]) -> Result<(FullBoxHeader, &[u8])> {
    if body.len() < 4 {
        return Err(DemuxError::malformed("full box shorter than version+flags"));
    }
    let header = FullBoxHeader {
        version: body[0],
        flags: ((body[1] as u32) << 16) | ((body[2] as u32) << 8) | body[3] as u32,
    };
    Ok((header, &body[4..]))
}

/// Big-endian field reads over a byte slice with bounds checking.
pub mod field {
    use byteorder::{BigEndian, ByteOrder};
    use demux::{DemuxError, Result};

    pub fn u16_at(data: &[u8], at: usize) -> Result<u16> {
        data.get(at..at + 2)
            .map(BigEndian::read_u16)
            .ok_or_else(|| DemuxError::malformed("field read past box end"))
    }

    pub fn u32_at(data: &[u8], at: usize) -> Result<u32> {
        data.get(at..at + 4)
            .map(BigEndian::read_u32)
            .ok_or_else(|| DemuxError::malformed("field read past box end"))
    }

    pub fn i32_at(data: &[u8], at: usize) -> Result<i32> {
        Ok(u32_at(data, at)? as i32)
    }

    pub fn u64_at(data: &[u8], at: usize) -> Result<u64> {
        data.get(at..at + 8)
            .map(BigEndian::read_u64)
            .ok_or_else(|| DemuxError::malformed("field read past box end"))
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::fourcc;

    fn make_box(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decode_header_basic() {
        let data = make_box(b"ftyp", &[0u8; 8]);
        let header = decode_header(&data).unwrap();
        assert_eq!(header.fourcc, fourcc::FTYP);
        assert_eq!(header.size, 16);
        assert_eq!(header.header_len, 8);
        assert!(!header.extends_to_end());
    }

    #[test]
    fn test_decode_header_extended() {
        let mut data = vec![0, 0, 0, 1];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 8]);
        let header = decode_header(&data).unwrap();
        assert_eq!(header.size, 24);
        assert_eq!(header.header_len, 16);
    }

    #[test]
    fn test_decode_header_extends_to_end() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"mdat");
        let header = decode_header(&data).unwrap();
        assert!(header.extends_to_end());
    }

    #[test]
    fn test_walker_iterates_siblings() {
        let mut data = make_box(b"free", b"xx");
        data.extend_from_slice(&make_box(b"mdat", b"abc"));
        let data = Bytes::from(data);

        let views: Vec<_> = BoxWalker::over(&data).map(|v| v.unwrap()).collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].fourcc, fourcc::FREE);
        assert_eq!(views[1].fourcc, fourcc::MDAT);
        assert_eq!(views[1].body(&data), b"abc");
    }

    #[test]
    fn test_walker_rejects_undersized_box() {
        // Declared size 4 < header size 8.
        let mut data = vec![0, 0, 0, 4];
        data.extend_from_slice(b"trak");
        data.extend_from_slice(&[0u8; 8]);
        let data = Bytes::from(data);

        let err = BoxWalker::over(&data).next().unwrap().unwrap_err();
        assert!(matches!(err, DemuxError::Malformed(_)));
    }

    #[test]
    fn test_walker_rejects_overrunning_child() {
        let mut data = vec![0, 0, 0, 64];
        data.extend_from_slice(b"trak");
        data.extend_from_slice(&[0u8; 8]);
        let data = Bytes::from(data);

        let err = BoxWalker::over(&data).next().unwrap().unwrap_err();
        assert!(matches!(err, DemuxError::Malformed(_)));
    }

    #[test]
    fn test_walker_skips_zero_size_child() {
        // Zero-size box below top level: skipped 4 bytes at a time until a
        // real header lines up.
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(&make_box(b"free", b""));
        let data = Bytes::from(data);

        let views: Vec<_> = BoxWalker::over(&data).map(|v| v.unwrap()).collect();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].fourcc, fourcc::FREE);
    }

    #[test]
    fn test_full_box() {
        let body = [1u8, 0, 0, 7, 0xAA];
        let (header, rest) = full_box(&body).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.flags, 7);
        assert_eq!(rest, &[0xAA]);
        assert!(full_box(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_field_reads() {
        let data = [0u8, 1, 0, 0, 0, 2];
        assert_eq!(field::u16_at(&data, 0).unwrap(), 1);
        assert_eq!(field::u32_at(&data, 2).unwrap(), 2);
        assert!(field::u32_at(&data, 4).is_err());
    }
}
