//! Frame codec for the fieldnet OSI-3 layer.
//!
//! This crate provides the small fixed headers used on field links: the OSI-3
//! routing header that precedes every frame, and the block headers that turn
//! an oversized OSI-7 payload into a sequence of long-telegram fragments.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+-----------------------------------+
//! | control byte (1B)    | priority, hop count, pointer      |
//! +----------------------+-----------------------------------+
//! | hop pairs (0..14B)   | (local port, remote port) * count |
//! +----------------------+-----------------------------------+
//! | OSI-7 payload        | telegram or long-telegram piece   |
//! +----------------------+-----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod error;
pub mod header;

// Re-export main types
pub use block::{
    big_capacity, is_long_telegram, BlockHeader, BlockPiece, FragmentKind, FrameFamily,
    COMMON_HEADER_SIZE, FRAME_BUDGET, MARKER_OFFSET, MAX_BIGGER_TOTAL, MAX_BIG_PIECES,
    MAX_BLOCK_NUMBER,
};
pub use error::WireError;
pub use header::{HopPair, Osi3Header, Priority, MAX_HEADER_SIZE, MAX_HOPS};
