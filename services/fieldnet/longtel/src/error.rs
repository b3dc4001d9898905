//! Segmentation and reassembly errors.

use fieldnet_wire::WireError;
use thiserror::Error;

use crate::SessionKey;

/// Errors raised by the segmenter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    /// Payload exceeds what a Bigger block can announce
    #[error("payload of {len} bytes exceeds the long-telegram capacity")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
    },

    /// Frame budget too small for the block headers
    #[error("frame budget of {0} bytes cannot carry a block header")]
    FrameBudget(usize),

    /// The dispatch task has stopped
    #[error("segmenter dispatch loop closed")]
    Closed,

    /// The frame sink could not deliver a piece
    #[error("transmit failed: {0}")]
    Transmit(String),
}

/// Why a reassembly session was discarded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Continuation fragment without a preceding start
    #[error("no open session")]
    Orphan,

    /// Next piece out of order
    #[error("piece {got} received, expected {expected}")]
    PieceIndex {
        /// Index the session expected
        expected: u16,
        /// Index carried by the fragment
        got: u16,
    },

    /// End piece after the wrong number of next pieces
    #[error("{got} pieces received, start announced {expected}")]
    PieceCount {
        /// Count announced by the start piece
        expected: u16,
        /// Next pieces actually received
        got: u16,
    },

    /// Assembled length differs from the announced total
    #[error("{got} bytes assembled, start announced {expected}")]
    Length {
        /// Total announced by the start piece
        expected: usize,
        /// Bytes assembled so far
        got: usize,
    },

    /// Start piece announces more than its pieces can carry
    #[error("start announces {total_len} bytes in {piece_count} next pieces, beyond the frame budget")]
    Announcement {
        /// Announced total length
        total_len: usize,
        /// Announced number of next pieces
        piece_count: u16,
    },

    /// Fragment for a session that already completed
    #[error("session already complete")]
    AlreadyFinished,
}

/// Errors raised by the reassembler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// Fragment header could not be decoded
    #[error("malformed fragment: {0}")]
    Malformed(#[from] WireError),

    /// The session was discarded
    #[error("sequence violation in {key}: {violation}")]
    SequenceViolation {
        /// Session the fragment belonged to
        key: SessionKey,
        /// What went wrong
        violation: Violation,
    },

    /// The session has not received its end piece yet
    #[error("session {0} not finished")]
    NotFinished(SessionKey),

    /// No session under this key
    #[error("no session {0}")]
    UnknownSession(SessionKey),
}
