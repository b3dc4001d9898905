//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame ends before the announced header does
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required by the header fields
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Traversal pointer points past the last hop pair
    #[error("pointer {pointer} beyond header length {length}")]
    Pointer {
        /// Decoded pointer field
        pointer: u8,
        /// Decoded length field
        length: u8,
    },

    /// Route needs more hop pairs than the control byte can express
    #[error("routing header needs {hops} hops, max {max}")]
    TooManyHops {
        /// Requested hop count
        hops: usize,
        /// Maximum hop count
        max: usize,
    },

    /// Priority class outside {1, 2}
    #[error("unknown priority class {0}")]
    Priority(u8),

    /// Unknown fragment kind nibble
    #[error("unknown fragment kind {0:#x}")]
    Kind(u8),

    /// Unknown or inconsistent block type nibble
    #[error("unknown block type {0:#x}")]
    BlockType(u8),

    /// Block number outside 1..=15
    #[error("block number {0} outside 1..=15")]
    BlockNumber(u8),

    /// Payload does not carry the long-telegram marker
    #[error("not a long-telegram fragment")]
    NotFragment,
}
