use demux::DemuxError;

use crate::state::ErrorKind;

/// Errors surfaced by the playback layer.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Demux(#[from] DemuxError),

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("audio path error: {0}")]
    Audio(String),

    #[error("renderer error: {0}")]
    Renderer(String),

    #[error("invalid state for this operation: {0}")]
    InvalidState(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl PlaybackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlaybackError::Demux(DemuxError::Io(_)) => ErrorKind::Io,
            PlaybackError::Demux(DemuxError::Malformed(_)) => ErrorKind::Malformed,
            PlaybackError::Demux(DemuxError::Unsupported(_)) => ErrorKind::Unsupported,
            PlaybackError::Demux(DemuxError::Cancelled) | PlaybackError::Cancelled => {
                ErrorKind::Cancelled
            }
            PlaybackError::Demux(_) => ErrorKind::Io,
            PlaybackError::Decoder(_) | PlaybackError::Renderer(_) => ErrorKind::Decoder,
            PlaybackError::Audio(_) => ErrorKind::Audio,
            PlaybackError::InvalidState(_) => ErrorKind::Unsupported,
        }
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            PlaybackError::Demux(DemuxError::malformed("x")).kind(),
            ErrorKind::Malformed
        );
        assert_eq!(PlaybackError::Decoder("d".into()).kind(), ErrorKind::Decoder);
        assert_eq!(PlaybackError::Audio("a".into()).kind(), ErrorKind::Audio);
        assert_eq!(PlaybackError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
