/// Seek precision selector.
///
/// `Closest` finds the nearest sample by time in either direction, decodes
/// from the nearest preceding sync sample, and reports the queried sample's
/// own time as the downstream target time; the sync-anchored modes land on a
/// sync sample directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
    /// Nearest sync sample at or before the requested time.
    #[default]
    PreviousSync,
    /// Nearest sync sample at or after the requested time.
    NextSync,
    /// Whichever sync sample is closer in time.
    ClosestSync,
    /// Nearest sample in either direction; decode starts at the preceding
    /// sync sample, with late-frame suppression up to the queried time.
    Closest,
}

/// One-shot seek instruction carried by [`ReadOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekTarget {
    pub time_us: i64,
    pub mode: SeekMode,
}

/// Options consumed by a single `read_sample` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Applied before reading, then cleared by the caller.
    pub seek: Option<SeekTarget>,
    /// Fail fast with `WouldBlock` instead of blocking when the byte range
    /// is not cached yet.
    pub non_blocking: bool,
}

impl ReadOptions {
    pub fn seeking(time_us: i64, mode: SeekMode) -> Self {
        Self {
            seek: Some(SeekTarget { time_us, mode }),
            non_blocking: false,
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }
}
