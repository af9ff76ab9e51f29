use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{DemuxError, Result};

/// Cached-data status reported by a [`ByteSource`].
///
/// For local sources everything is trivially cached; the caching facade over
/// a network stream reports how far the contiguous prefix has arrived so the
/// buffering monitor can drive watermark transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    /// Absolute end of the contiguous cached prefix.
    pub cached_to: u64,
    /// Total stream length, if known.
    pub total_len: Option<u64>,
    /// Whether the source has finished arriving (EOS observed by the fetcher).
    pub reached_end: bool,
    /// Average content bitrate in bits per second, if the fetch layer has
    /// estimated one.
    pub bitrate_bps: Option<u32>,
}

impl CacheStatus {
    /// Status for a fully-available local source of `len` bytes.
    pub fn local(len: u64) -> Self {
        Self {
            cached_to: len,
            total_len: Some(len),
            reached_end: true,
            bitrate_bps: None,
        }
    }

    /// Bytes cached at or beyond `offset`.
    pub fn cached_bytes_from(&self, offset: u64) -> u64 {
        self.cached_to.saturating_sub(offset)
    }

    /// Whether `[offset, offset + len)` can be served without blocking.
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        offset.saturating_add(len) <= self.cached_to
            || (self.reached_end && self.total_len.is_some_and(|t| offset >= t))
    }
}

/// Random-access byte-range reader.
///
/// Shared (`Arc`) between the structural parser and live sample readers; the
/// source carries its own synchronization.
pub trait ByteSource: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. A return of `Ok(0)` means
    /// end of stream at that offset; short reads are legal.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total length in bytes, if known. A source still arriving over the
    /// network may not know its length yet.
    fn len(&self) -> Option<u64>;

    fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether the bytes are locally available (no fetch latency).
    fn is_local(&self) -> bool {
        true
    }

    fn cache_status(&self) -> CacheStatus {
        CacheStatus::local(self.len().unwrap_or(0))
    }

    /// Hint that active fetching should resume (caching sources only).
    fn resume_fetch(&self) {}

    /// Hint that active fetching may pause (caching sources only).
    fn suspend_fetch(&self) {}
}

/// Read exactly `buf.len()` bytes at `offset`, or fail with `UnexpectedEof`.
pub fn read_exact_at(source: &dyn ByteSource, mut offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read_at(offset, &mut buf[filled..])?;
        if n == 0 {
            return Err(DemuxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "short read at offset {offset}: wanted {} more bytes",
                    buf.len() - filled
                ),
            )));
        }
        filled += n;
        offset += n as u64;
    }
    Ok(())
}

/// Read exactly `len` bytes at `offset` into a fresh buffer.
pub fn read_bytes_at(source: &dyn ByteSource, offset: u64, len: usize) -> Result<Bytes> {
    let mut buf = BytesMut::zeroed(len);
    read_exact_at(source, offset, &mut buf)?;
    Ok(buf.freeze())
}

/// Local file source.
///
/// Positional reads go through a shared seek cursor; the mutex keeps them
/// coherent when the parser and a sample reader share the handle.
pub struct FileSource {
    file: Mutex<File>,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(buf)?;
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// In-memory source over a `Bytes` buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.as_ref();
        let start = offset.min(data.len() as u64) as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
