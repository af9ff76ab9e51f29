//! # ISO Base Media File Format demuxer
//!
//! Recursive box-tree parser for MP4/MOV-family containers, producing a
//! track registry with per-track sample indexes and pull readers for both
//! monolithic (fully indexed) and fragmented (streamed-append) layouts.
//!
//! The structural parse is a single top-down pass that stops as soon as
//! playback can begin: once a movie header or segment index has been seen
//! together with media data or a movie fragment, remaining bytes are only
//! touched by sample reads. Malformed tracks are dropped individually; a
//! file-level structural violation aborts extraction.

pub mod boxes;
mod crypto;
pub mod dump;
mod extractor;
pub mod fourcc;
mod frag;
mod index;
mod meta;
mod moov;
mod parser;
mod sidx;
mod stbl;
mod track;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use extractor::IsobmffExtractor;
pub use frag::{FragmentBatch, FragmentSample, FragmentScanner, TrexDefaults};
pub use index::{SampleIndex, SampleMeta, SeekResolution};
pub use parser::{ParsedFile, TOP_LEVEL_SCAN_LIMIT, parse};
pub use sidx::{SegmentIndex, SidxLocation, SidxReference};
pub use track::Track;
