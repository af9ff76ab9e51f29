use bytes::Bytes;

/// One clear/encrypted byte-range pair within an encrypted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsample {
    pub clear_bytes: u16,
    pub encrypted_bytes: u32,
}

/// Per-sample encryption side data, attached by the demuxer and consumed by
/// a decryption layer downstream. Never decrypted here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CryptoInfo {
    /// Initialization vector for this sample; empty when the track's default
    /// per-sample IV size is zero.
    pub iv: Bytes,
    /// Clear/encrypted range pairs; empty means the whole payload is
    /// encrypted.
    pub subsamples: Vec<Subsample>,
}

/// One compressed media sample as emitted by a track reader.
#[derive(Debug, Clone)]
pub struct Sample {
    pub track_id: u32,
    pub data: Bytes,
    /// Decode timestamp in microseconds.
    pub decode_time_us: i64,
    /// Presentation (composition) timestamp in microseconds.
    pub presentation_time_us: i64,
    /// Decode duration in microseconds.
    pub duration_us: i64,
    /// Whether this sample is decodable without reference to prior samples.
    pub is_sync: bool,
    /// When set, downstream should decode but discard frames whose timestamp
    /// precedes this value (seek-to-closest semantics).
    pub target_time_us: Option<i64>,
    pub crypto: Option<CryptoInfo>,
}

impl Sample {
    /// Whether the payload carries no data (defective-encoder padding).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
