use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::extractor::MediaExtractor;
use crate::source::ByteSource;
use crate::{DemuxError, Result};

/// Bytes prefetched before committing to a format recognizer.
pub const MIN_SNIFF_BYTES: usize = 4096;

/// Poll interval while waiting for a networked source to cache sniff bytes.
const SNIFF_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A registered container-format recognizer.
pub struct FormatDescriptor {
    pub name: &'static str,
    /// Score the leading bytes: 0 means "not this format", higher wins.
    pub score: fn(&[u8]) -> u8,
    /// Instantiate the extractor; performs the structural parse.
    pub instantiate: fn(Arc<dyn ByteSource>) -> Result<Box<dyn MediaExtractor>>,
}

/// Format-sniffing dispatcher.
///
/// Probes a source's leading bytes against every registered recognizer and
/// instantiates the best-scoring extractor. For networked sources, sniffing
/// waits (cancellably) until a minimum prefix has been cached, so extractor
/// instantiation never begins against an empty cache.
pub struct Probe {
    formats: Vec<FormatDescriptor>,
    min_sniff_bytes: usize,
}

impl Default for Probe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe {
    pub fn new() -> Self {
        Self {
            formats: Vec::new(),
            min_sniff_bytes: MIN_SNIFF_BYTES,
        }
    }

    pub fn with_min_sniff_bytes(mut self, bytes: usize) -> Self {
        self.min_sniff_bytes = bytes;
        self
    }

    pub fn register(&mut self, descriptor: FormatDescriptor) {
        debug!(format = descriptor.name, "registered format");
        self.formats.push(descriptor);
    }

    /// Sniff `source` and instantiate the matching extractor.
    pub fn format(
        &self,
        source: Arc<dyn ByteSource>,
        token: &CancellationToken,
    ) -> Result<Box<dyn MediaExtractor>> {
        let header = self.sniff_bytes(source.as_ref(), token)?;

        let mut best: Option<(&FormatDescriptor, u8)> = None;
        for descriptor in &self.formats {
            let score = (descriptor.score)(&header);
            debug!(format = descriptor.name, score, "probed format");
            if score > 0 && best.is_none_or(|(_, s)| score > s) {
                best = Some((descriptor, score));
            }
        }

        let Some((descriptor, score)) = best else {
            return Err(DemuxError::unsupported(
                "no registered format recognized the stream",
            ));
        };

        debug!(format = descriptor.name, score, "instantiating extractor");
        (descriptor.instantiate)(source)
    }

    /// Prefetch the sniff window, polling the cache for networked sources
    /// with a cancellation check every iteration.
    fn sniff_bytes(&self, source: &dyn ByteSource, token: &CancellationToken) -> Result<Vec<u8>> {
        if !source.is_local() {
            loop {
                if token.is_cancelled() {
                    return Err(DemuxError::Cancelled);
                }
                let status = source.cache_status();
                if status.cached_to >= self.min_sniff_bytes as u64 || status.reached_end {
                    break;
                }
                std::thread::sleep(SNIFF_POLL_INTERVAL);
            }
        }

        let mut header = vec![0u8; self.min_sniff_bytes];
        let mut filled = 0;
        while filled < header.len() {
            if token.is_cancelled() {
                return Err(DemuxError::Cancelled);
            }
            let n = source.read_at(filled as u64, &mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            warn!("source is empty, nothing to sniff");
        }
        header.truncate(filled);
        Ok(header)
    }
}
