//! Long-telegram segmentation and reassembly.
//!
//! Payloads larger than one frame travel as a block of fragments: a start
//! piece announcing the total length and piece count, numbered next pieces,
//! and an end piece. The [`Segmenter`] produces them under a per-destination
//! window of block numbers; the [`Reassembler`] rebuilds the payload on the
//! receiving side.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod reassembler;
pub mod segmenter;

// Re-export main types
pub use error::{ReassemblyError, SegmentError, Violation};
pub use reassembler::{FragmentOutcome, Reassembler, ReassemblyConfig, SessionKey};
pub use segmenter::{
    segment, ChecksumMode, FrameSink, SegmentationSession, Segmenter, SegmenterConfig,
};
