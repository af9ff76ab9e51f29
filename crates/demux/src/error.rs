use std::io;

/// Error taxonomy for demuxing.
///
/// `EndOfStream` and `WouldBlock` are expected conditions rather than
/// failures: the first lets callers tell "finished" from "broke", the second
/// tells a non-blocking caller to retry once more data is cached.
#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed container: {0}")]
    Malformed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("operation would block")]
    WouldBlock,

    #[error("end of stream")]
    EndOfStream,

    #[error("operation cancelled")]
    Cancelled,
}

impl DemuxError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        DemuxError::Malformed(detail.into())
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        DemuxError::Unsupported(detail.into())
    }

    /// True for the expected terminal condition, as opposed to a failure.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DemuxError::EndOfStream)
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, DemuxError::WouldBlock)
    }
}
