//! Video path: one track's pull reader, decoder and renderer, with the
//! frame-read loop the orchestrator's timed event drives.

use demux::{DemuxError, SeekMode, TrackSource};
use media_types::{Resolution, Rotation};
use tracing::{debug, trace};

use crate::PlaybackError;
use crate::actors::{DecodeEvent, VideoDecoder, VideoFrame, VideoRenderer};
use crate::state::VideoScalingMode;

/// Outcome of one frame read.
#[derive(Debug)]
pub enum FrameRead {
    Frame(VideoFrame),
    EndOfStream,
}

pub struct VideoPath {
    source: TrackSource,
    decoder: Box<dyn VideoDecoder>,
    renderer: Box<dyn VideoRenderer>,
    renderer_ready: bool,
    geometry: Option<Resolution>,
    rotation: Rotation,
    scaling: VideoScalingMode,
    /// One-frame look-ahead storage for deadline scheduling.
    pending: Option<VideoFrame>,
    /// Seek-to-closest target: earlier decoded frames are discarded.
    target_time_us: Option<i64>,
    eos_signaled: bool,
}

impl VideoPath {
    pub fn new(
        source: TrackSource,
        decoder: Box<dyn VideoDecoder>,
        renderer: Box<dyn VideoRenderer>,
    ) -> Self {
        let info = source.info();
        let geometry = info.display_resolution.or(info.resolution);
        let rotation = info.rotation;
        Self {
            source,
            decoder,
            renderer,
            renderer_ready: false,
            geometry,
            rotation,
            scaling: VideoScalingMode::default(),
            pending: None,
            target_time_us: None,
            eos_signaled: false,
        }
    }

    pub fn source(&self) -> &TrackSource {
        &self.source
    }

    pub fn set_scaling(&mut self, scaling: VideoScalingMode) {
        if self.scaling != scaling {
            self.scaling = scaling;
            self.renderer_ready = false;
        }
    }

    pub fn take_pending(&mut self) -> Option<VideoFrame> {
        self.pending.take()
    }

    pub fn store_pending(&mut self, frame: VideoFrame) {
        self.pending = Some(frame);
    }

    /// Arm a seek on the track source and reset decode state.
    pub fn seek(&mut self, time_us: i64, mode: SeekMode) {
        debug!(time_us, ?mode, "video path seek");
        self.source.seek_to(time_us, mode);
        self.decoder.flush();
        self.pending = None;
        self.target_time_us = None;
        self.eos_signaled = false;
    }

    /// Read one decoded frame.
    ///
    /// Loops past zero-length buffers, feeds the decoder as it asks for
    /// data, handles format changes by recomputing geometry and marking the
    /// renderer for reinitialization, and silently discards frames earlier
    /// than a pending seek-target time.
    pub fn read_frame(&mut self) -> Result<FrameRead, PlaybackError> {
        if let Some(frame) = self.pending.take() {
            return Ok(FrameRead::Frame(frame));
        }

        loop {
            match self.decoder.poll()? {
                DecodeEvent::Frame(frame) => {
                    if let Some(target) = self.target_time_us {
                        if frame.presentation_time_us < target {
                            trace!(
                                pts = frame.presentation_time_us,
                                target,
                                "discarding pre-target frame"
                            );
                            self.renderer.discard(&frame);
                            continue;
                        }
                        self.target_time_us = None;
                    }
                    return Ok(FrameRead::Frame(frame));
                }
                DecodeEvent::EmptyBuffer => continue,
                DecodeEvent::FormatChanged(resolution) => {
                    debug!(%resolution, "video format changed");
                    self.geometry = Some(resolution);
                    self.renderer_ready = false;
                    continue;
                }
                DecodeEvent::NeedsData => {
                    if self.eos_signaled {
                        // The decoder has all remaining input; keep polling
                        // until it drains to EndOfStream.
                        continue;
                    }
                    match self.source.read_sample(false) {
                        Ok(sample) => {
                            if let Some(target) = sample.target_time_us {
                                self.target_time_us = Some(target);
                            }
                            self.decoder.submit(&sample)?;
                        }
                        Err(DemuxError::EndOfStream) => {
                            self.decoder.signal_end_of_stream();
                            self.eos_signaled = true;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                DecodeEvent::EndOfStream => return Ok(FrameRead::EndOfStream),
            }
        }
    }

    /// Render a frame, initializing the renderer lazily on the first frame
    /// or after a geometry/scaling change.
    pub fn render(&mut self, frame: &VideoFrame) -> Result<(), PlaybackError> {
        if !self.renderer_ready {
            let geometry = self.geometry.unwrap_or(Resolution::new(0, 0));
            self.renderer.init(geometry, self.rotation, self.scaling)?;
            self.renderer_ready = true;
        }
        self.renderer.render(frame)
    }

    pub fn discard(&mut self, frame: &VideoFrame) {
        self.renderer.discard(frame);
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;
    use crate::sim::{ScriptedDecoder, SimVideoRenderer};
    use bytes::Bytes;
    use demux::{
        CodecConfig, FileMetadata, MediaExtractor, ReadOptions, Result as DemuxResult, Sample,
        TrackInfo, TrackReader,
    };
    use media_types::{TimeBase, TrackKind, mime};

    fn test_info() -> TrackInfo {
        TrackInfo {
            id: 1,
            mime: mime::VIDEO_AVC.to_string(),
            kind: TrackKind::Video,
            time_base: TimeBase::new(90_000).unwrap(),
            duration_us: Some(1_000_000),
            language: None,
            resolution: Some(Resolution::new(320, 240)),
            display_resolution: None,
            rotation: Rotation::R0,
            sample_rate: None,
            channel_count: None,
            codec_configs: Vec::<CodecConfig>::new(),
            encryption: None,
            sample_count: 3,
        }
    }

    struct SampleFeed {
        samples: Vec<Sample>,
        at: usize,
    }

    impl TrackReader for SampleFeed {
        fn next_sample(&mut self, _options: &ReadOptions) -> DemuxResult<Sample> {
            let Some(sample) = self.samples.get(self.at).cloned() else {
                return Err(DemuxError::EndOfStream);
            };
            self.at += 1;
            Ok(sample)
        }
    }

    struct FeedExtractor {
        metadata: FileMetadata,
        infos: Vec<TrackInfo>,
        samples: parking_lot::Mutex<Vec<Sample>>,
    }

    impl MediaExtractor for FeedExtractor {
        fn metadata(&self) -> &FileMetadata {
            &self.metadata
        }
        fn tracks(&self) -> &[TrackInfo] {
            &self.infos
        }
        fn open_track(&self, _index: usize) -> DemuxResult<Box<dyn TrackReader>> {
            Ok(Box::new(SampleFeed {
                samples: self.samples.lock().clone(),
                at: 0,
            }))
        }
    }

    fn make_sample(pts: i64, target: Option<i64>) -> Sample {
        Sample {
            track_id: 1,
            data: Bytes::from_static(b"x"),
            decode_time_us: pts,
            presentation_time_us: pts,
            duration_us: 33_333,
            is_sync: true,
            target_time_us: target,
            crypto: None,
        }
    }

    fn make_source(samples: Vec<Sample>) -> TrackSource {
        let extractor = FeedExtractor {
            metadata: FileMetadata::default(),
            infos: vec![test_info()],
            samples: parking_lot::Mutex::new(samples),
        };
        TrackSource::open(&extractor, 0).unwrap()
    }

    #[test]
    fn test_format_change_marks_renderer_dirty_and_continues() {
        let source = make_source(vec![make_sample(0, None)]);
        let script = vec![
            DecodeEvent::FormatChanged(Resolution::new(640, 480)),
            DecodeEvent::EmptyBuffer,
            DecodeEvent::Frame(VideoFrame {
                presentation_time_us: 0,
                buffer: Bytes::new(),
            }),
        ];
        let (renderer, stats) = SimVideoRenderer::new();
        let mut path = VideoPath::new(
            source,
            Box::new(ScriptedDecoder::new(script)),
            Box::new(renderer),
        );

        let FrameRead::Frame(frame) = path.read_frame().unwrap() else {
            panic!("expected frame");
        };
        path.render(&frame).unwrap();
        assert_eq!(stats.lock().inits, 1);
        assert_eq!(path.geometry, Some(Resolution::new(640, 480)));
    }

    #[test]
    fn test_target_time_discards_early_frames() {
        // Sample carries a 100ms target: the 0 and 50ms frames are
        // discarded, the 100ms frame is returned.
        let source = make_source(vec![make_sample(0, Some(100_000))]);
        let frames = [0i64, 50_000, 100_000].map(|pts| {
            DecodeEvent::Frame(VideoFrame {
                presentation_time_us: pts,
                buffer: Bytes::new(),
            })
        });
        let script = vec![
            DecodeEvent::NeedsData,
            frames[0].clone(),
            frames[1].clone(),
            frames[2].clone(),
        ];
        let (renderer, stats) = SimVideoRenderer::new();
        let mut path = VideoPath::new(
            source,
            Box::new(ScriptedDecoder::new(script)),
            Box::new(renderer),
        );

        let FrameRead::Frame(frame) = path.read_frame().unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.presentation_time_us, 100_000);
        assert_eq!(stats.lock().discarded, 2);
    }

    #[test]
    fn test_eos_propagates_after_drain() {
        let source = make_source(vec![]);
        let script = vec![DecodeEvent::NeedsData, DecodeEvent::EndOfStream];
        let (renderer, _) = SimVideoRenderer::new();
        let mut path = VideoPath::new(
            source,
            Box::new(ScriptedDecoder::new(script)),
            Box::new(renderer),
        );
        assert!(matches!(path.read_frame().unwrap(), FrameRead::EndOfStream));
    }

    #[test]
    fn test_pending_frame_returned_first() {
        let source = make_source(vec![]);
        let (renderer, _) = SimVideoRenderer::new();
        let mut path = VideoPath::new(
            source,
            Box::new(ScriptedDecoder::new(vec![])),
            Box::new(renderer),
        );
        path.store_pending(VideoFrame {
            presentation_time_us: 42,
            buffer: Bytes::new(),
        });
        let FrameRead::Frame(frame) = path.read_frame().unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.presentation_time_us, 42);
    }
}
