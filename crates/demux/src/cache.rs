use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::source::{ByteSource, CacheStatus};
use crate::{DemuxError, Result};

/// How long a blocking read waits for the cache to grow before giving up.
const FILL_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CacheState {
    /// End of the contiguous prefix that has "arrived".
    available: u64,
    /// Whether the simulated fetcher is paused.
    suspended: bool,
    /// Whether the upstream fetch has completed.
    finished: bool,
    bitrate_bps: Option<u32>,
}

/// Caching facade standing in for the network fetch/cache collaborator.
///
/// Wraps any [`ByteSource`] and exposes only the contiguous prefix that has
/// "arrived" so far. Blocking reads past the prefix wait for the cache to
/// grow; [`CacheStatus`] reports progress to the buffering monitor. The
/// arrival schedule is driven externally through [`CachingSource::advance`]
/// (tests, the CLI simulator, or a real fetch task).
pub struct CachingSource {
    inner: Arc<dyn ByteSource>,
    state: Mutex<CacheState>,
    filled: Condvar,
}

impl CachingSource {
    pub fn new(inner: Arc<dyn ByteSource>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            state: Mutex::new(CacheState {
                available: 0,
                suspended: false,
                finished: false,
                bitrate_bps: None,
            }),
            filled: Condvar::new(),
        })
    }

    /// Mark the whole underlying source as arrived.
    pub fn fill_all(&self) {
        let len = self.inner.len().unwrap_or(0);
        let mut state = self.state.lock();
        state.available = len;
        state.finished = true;
        self.filled.notify_all();
    }

    /// Extend the arrived prefix by `n` bytes.
    pub fn advance(&self, n: u64) {
        let mut state = self.state.lock();
        state.available = state.available.saturating_add(n);
        if let Some(len) = self.inner.len()
            && state.available >= len
        {
            state.available = len;
            state.finished = true;
        }
        trace!(available = state.available, "cache advanced");
        self.filled.notify_all();
    }

    /// Declare the fetch finished regardless of position (e.g. truncated
    /// upstream).
    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        self.filled.notify_all();
    }

    pub fn set_bitrate(&self, bitrate_bps: u32) {
        self.state.lock().bitrate_bps = Some(bitrate_bps);
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }
}

impl ByteSource for CachingSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let wanted_end = offset.saturating_add(buf.len() as u64);
        {
            let mut state = self.state.lock();
            while state.available < wanted_end && !state.finished {
                let timed_out = self
                    .filled
                    .wait_for(&mut state, FILL_WAIT_TIMEOUT)
                    .timed_out();
                if timed_out && state.available < wanted_end && !state.finished {
                    debug!(offset, "timed out waiting for cache fill");
                    return Err(DemuxError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "cache fill stalled",
                    )));
                }
            }
            // Serve only the arrived range once finished.
            if state.available <= offset {
                return Ok(0);
            }
            let serveable = (state.available - offset).min(buf.len() as u64) as usize;
            drop(state);
            return self.inner.read_at(offset, &mut buf[..serveable]);
        }
    }

    fn len(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.finished {
            Some(state.available.min(self.inner.len().unwrap_or(state.available)))
        } else {
            self.inner.len()
        }
    }

    fn is_local(&self) -> bool {
        false
    }

    fn cache_status(&self) -> CacheStatus {
        let state = self.state.lock();
        CacheStatus {
            cached_to: state.available,
            total_len: self.inner.len(),
            reached_end: state.finished,
            bitrate_bps: state.bitrate_bps,
        }
    }

    fn resume_fetch(&self) {
        let mut state = self.state.lock();
        if state.suspended {
            debug!("cache fetch resumed");
            state.suspended = false;
        }
    }

    fn suspend_fetch(&self) {
        let mut state = self.state.lock();
        if !state.suspended {
            debug!("cache fetch suspended");
            state.suspended = true;
        }
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use bytes::Bytes;

    fn make_cache(data: &'static [u8]) -> Arc<CachingSource> {
        CachingSource::new(Arc::new(MemorySource::new(Bytes::from_static(data))))
    }

    #[test]
    fn test_reads_within_prefix() {
        let cache = make_cache(b"abcdefgh");
        cache.advance(4);
        let mut buf = [0u8; 4];
        assert_eq!(cache.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert!(!cache.cache_status().reached_end);
    }

    #[test]
    fn test_blocking_read_wakes_on_advance() {
        let cache = make_cache(b"abcdefgh");
        cache.advance(2);

        let cache2 = Arc::clone(&cache);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 6];
            let n = cache2.read_at(0, &mut buf).unwrap();
            (n, buf)
        });

        std::thread::sleep(Duration::from_millis(20));
        cache.advance(10);
        let (n, buf) = handle.join().unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_finished_serves_partial() {
        let cache = make_cache(b"abcd");
        cache.advance(2);
        cache.finish();
        let mut buf = [0u8; 4];
        assert_eq!(cache.read_at(0, &mut buf).unwrap(), 2);
        assert_eq!(cache.read_at(2, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_suspend_resume() {
        let cache = make_cache(b"abcd");
        assert!(!cache.is_suspended());
        cache.suspend_fetch();
        assert!(cache.is_suspended());
        cache.resume_fetch();
        assert!(!cache.is_suspended());
    }

    #[test]
    fn test_fill_all() {
        let cache = make_cache(b"abcd");
        cache.fill_all();
        let status = cache.cache_status();
        assert_eq!(status.cached_to, 4);
        assert!(status.reached_end);
        assert!(!cache.is_local());
    }
}
