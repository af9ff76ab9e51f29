//! Shared media domain types used across the demuxing and playback crates.

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count, useful for sanity ceilings on decoder allocation.
    #[inline]
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Swap width and height (90/270 degree display rotation).
    #[inline]
    pub fn transposed(&self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Display rotation of a video track, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    /// Map a degree value to a rotation. Only the four cardinal values are
    /// representable; anything else returns `None`.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::R0),
            90 => Some(Rotation::R90),
            180 => Some(Rotation::R180),
            270 => Some(Rotation::R270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }

    /// Whether this rotation swaps the display axes.
    pub fn is_transposed(&self) -> bool {
        matches!(self, Rotation::R90 | Rotation::R270)
    }
}

/// Elementary stream category of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    /// Timed text / subtitles.
    Text,
    /// Timed metadata or anything else we carry but do not play.
    Other,
}

impl TrackKind {
    /// Classify from a MIME type string (`video/avc`, `audio/mp4a-latm`, ...).
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("video/") {
            TrackKind::Video
        } else if mime.starts_with("audio/") {
            TrackKind::Audio
        } else if mime.starts_with("text/") || mime.starts_with("application/x-subrip") {
            TrackKind::Text
        } else {
            TrackKind::Other
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
            TrackKind::Text => write!(f, "text"),
            TrackKind::Other => write!(f, "other"),
        }
    }
}

/// Ticks-per-second unit for a track's internal time values.
///
/// All tick↔microsecond conversions in the workspace go through this type so
/// the truncation behavior is identical everywhere. Downstream lateness
/// computations are sensitive to systematic bias, so both directions truncate
/// and never round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    timescale: u32,
}

impl TimeBase {
    /// A timescale of zero is structurally invalid; callers reject such
    /// tracks before constructing a `TimeBase`.
    pub fn new(timescale: u32) -> Option<Self> {
        if timescale == 0 { None } else { Some(Self { timescale }) }
    }

    #[inline]
    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    /// `ticks * 1_000_000 / timescale`, truncating.
    #[inline]
    pub fn ticks_to_us(&self, ticks: u64) -> i64 {
        ((ticks as u128 * 1_000_000) / self.timescale as u128) as i64
    }

    /// Signed variant for composition-time offsets.
    #[inline]
    pub fn ticks_to_us_signed(&self, ticks: i64) -> i64 {
        ((ticks as i128 * 1_000_000) / self.timescale as i128) as i64
    }

    /// `us * timescale / 1_000_000`, truncating. Negative times clamp to 0.
    #[inline]
    pub fn us_to_ticks(&self, us: i64) -> u64 {
        if us <= 0 {
            return 0;
        }
        ((us as u128 * self.timescale as u128) / 1_000_000) as u64
    }
}

/// MIME type strings for the codecs this workspace recognizes.
pub mod mime {
    pub const VIDEO_AVC: &str = "video/avc";
    pub const VIDEO_HEVC: &str = "video/hevc";
    pub const VIDEO_AV1: &str = "video/av01";
    pub const VIDEO_MP4V: &str = "video/mp4v-es";
    pub const AUDIO_AAC: &str = "audio/mp4a-latm";
    pub const AUDIO_AC3: &str = "audio/ac3";
    pub const AUDIO_EAC3: &str = "audio/eac3";
    pub const AUDIO_OPUS: &str = "audio/opus";
    pub const TEXT_3GPP: &str = "text/3gpp-tt";
    pub const CONTAINER_MP4: &str = "video/mp4";
    pub const CONTAINER_QUICKTIME: &str = "video/quicktime";
}
