//! Long-telegram block headers.
//!
//! A long telegram travels as a sequence of ordinary OSI-7 payloads whose
//! fourth byte is zero. All of them share a six byte prefix:
//!
//! ```text
//! +-----------+--------+-------------+----------------------------+
//! | sender 3B | 0x00   | kind (low4) | block type << 4 | block nr |
//! +-----------+--------+-------------+----------------------------+
//! ```
//!
//! followed by family specific fields (total length and piece count on the
//! start piece, the piece index on next pieces, a checksum slot on the end
//! piece) and then the carried data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Default OSI-7 frame budget of the field link layer in bytes
pub const FRAME_BUDGET: usize = 238;

/// Size of the prefix shared by all block headers
pub const COMMON_HEADER_SIZE: usize = 6;

/// Offset of the byte that marks a payload as a long-telegram fragment
pub const MARKER_OFFSET: usize = 3;

/// Highest block number; block numbers run 1..=15
pub const MAX_BLOCK_NUMBER: u8 = 15;

/// Maximum number of next pieces a Big block can announce
pub const MAX_BIG_PIECES: usize = 253;

/// Largest total length expressible in a Bigger start piece
pub const MAX_BIGGER_TOTAL: usize = (1 << 24) - 1;

/// Set on every block type nibble (bit 4 of byte 5)
const BLOCK_TYPE_FLAG: u8 = 0x1;

/// Whether an OSI-7 payload is a long-telegram fragment
pub fn is_long_telegram(payload: &[u8]) -> bool {
    payload.len() >= COMMON_HEADER_SIZE && payload[MARKER_OFFSET] == 0
}

/// Frame family used for a whole long telegram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFamily {
    /// Fits into a single frame
    Short,
    /// 1 byte piece counters, 2 byte total length
    Big,
    /// 2 byte piece counters, 3 byte total length
    Bigger,
}

impl FrameFamily {
    /// Pick the family for a payload of `len` bytes under a frame budget
    pub fn select(len: usize, budget: usize) -> Self {
        if len + COMMON_HEADER_SIZE <= budget {
            FrameFamily::Short
        } else if len < big_capacity(budget) {
            FrameFamily::Big
        } else {
            FrameFamily::Bigger
        }
    }

    /// Header size of the start piece (the single piece for Short)
    pub fn start_header_len(self) -> usize {
        match self {
            FrameFamily::Short => COMMON_HEADER_SIZE,
            FrameFamily::Big => COMMON_HEADER_SIZE + 3,
            FrameFamily::Bigger => COMMON_HEADER_SIZE + 5,
        }
    }

    /// Header size of a next piece
    pub fn next_header_len(self) -> usize {
        match self {
            FrameFamily::Short => COMMON_HEADER_SIZE,
            FrameFamily::Big => COMMON_HEADER_SIZE + 1,
            FrameFamily::Bigger => COMMON_HEADER_SIZE + 2,
        }
    }

    /// Header size of the end piece
    pub fn end_header_len(self) -> usize {
        match self {
            FrameFamily::Short => COMMON_HEADER_SIZE,
            FrameFamily::Big => COMMON_HEADER_SIZE + 2,
            FrameFamily::Bigger => COMMON_HEADER_SIZE + 4,
        }
    }

    /// Largest piece count a start piece of this family can announce
    pub fn max_pieces(self) -> usize {
        match self {
            FrameFamily::Short => 0,
            FrameFamily::Big => MAX_BIG_PIECES,
            FrameFamily::Bigger => u16::MAX as usize,
        }
    }

    /// Block type nibble carried in the high half of byte 5
    pub fn block_type(self) -> u8 {
        match self {
            FrameFamily::Short => BLOCK_TYPE_FLAG,
            FrameFamily::Big => 0x2 | BLOCK_TYPE_FLAG,
            FrameFamily::Bigger => 0x4 | BLOCK_TYPE_FLAG,
        }
    }

    /// Parse a block type nibble
    pub fn from_block_type(value: u8) -> Result<Self, WireError> {
        match value {
            0x1 => Ok(FrameFamily::Short),
            0x3 => Ok(FrameFamily::Big),
            0x5 => Ok(FrameFamily::Bigger),
            _ => Err(WireError::BlockType(value)),
        }
    }
}

/// Exclusive upper bound on payload length for the Big family
pub fn big_capacity(budget: usize) -> usize {
    let family = FrameFamily::Big;
    MAX_BIG_PIECES * (budget - family.next_header_len())
        + (budget - family.start_header_len())
        + (budget - family.end_header_len())
}

/// Kind of a single fragment (low nibble of byte 4)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentKind {
    /// Whole telegram in one frame
    ShortBlock = 0x0,
    /// First piece of a Big block
    StartBig = 0x1,
    /// Middle piece of a Big block
    NextBigPiece = 0x2,
    /// Last piece of a Big block
    EndBigBlock = 0x3,
    /// First piece of a Bigger block
    StartBigger = 0x4,
    /// Middle piece of a Bigger block
    NextBiggerPiece = 0x5,
    /// Last piece of a Bigger block
    EndBiggerBlock = 0x6,
}

impl TryFrom<u8> for FragmentKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(FragmentKind::ShortBlock),
            0x1 => Ok(FragmentKind::StartBig),
            0x2 => Ok(FragmentKind::NextBigPiece),
            0x3 => Ok(FragmentKind::EndBigBlock),
            0x4 => Ok(FragmentKind::StartBigger),
            0x5 => Ok(FragmentKind::NextBiggerPiece),
            0x6 => Ok(FragmentKind::EndBiggerBlock),
            _ => Err(WireError::Kind(value)),
        }
    }
}

impl FragmentKind {
    /// Family the fragment belongs to
    pub fn family(self) -> FrameFamily {
        match self {
            FragmentKind::ShortBlock => FrameFamily::Short,
            FragmentKind::StartBig | FragmentKind::NextBigPiece | FragmentKind::EndBigBlock => {
                FrameFamily::Big
            }
            FragmentKind::StartBigger
            | FragmentKind::NextBiggerPiece
            | FragmentKind::EndBiggerBlock => FrameFamily::Bigger,
        }
    }

    /// Whether this fragment opens a new block
    pub fn is_start(self) -> bool {
        matches!(
            self,
            FragmentKind::ShortBlock | FragmentKind::StartBig | FragmentKind::StartBigger
        )
    }
}

/// Family specific part of a block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPiece {
    /// Single-frame block
    Short,
    /// Start piece announcing the whole block
    Start {
        /// Total payload length of the block
        total_len: u32,
        /// Number of next pieces that follow
        piece_count: u16,
    },
    /// Middle piece
    Next {
        /// 1-based piece index
        index: u16,
    },
    /// End piece
    End {
        /// Checksum slot; written as a placeholder and never verified
        checksum: u32,
    },
}

/// Decoded long-telegram block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Sender address (24 bit)
    pub sender: u32,
    /// Frame family of the block
    pub family: FrameFamily,
    /// Block number 1..=15
    pub block_number: u8,
    /// Piece specific fields
    pub piece: BlockPiece,
}

impl BlockHeader {
    /// Fragment kind encoded for this header
    pub fn kind(&self) -> FragmentKind {
        match (self.family, self.piece) {
            (FrameFamily::Big, BlockPiece::Start { .. }) => FragmentKind::StartBig,
            (FrameFamily::Big, BlockPiece::Next { .. }) => FragmentKind::NextBigPiece,
            (FrameFamily::Big, BlockPiece::End { .. }) => FragmentKind::EndBigBlock,
            (FrameFamily::Bigger, BlockPiece::Start { .. }) => FragmentKind::StartBigger,
            (FrameFamily::Bigger, BlockPiece::Next { .. }) => FragmentKind::NextBiggerPiece,
            (FrameFamily::Bigger, BlockPiece::End { .. }) => FragmentKind::EndBiggerBlock,
            _ => FragmentKind::ShortBlock,
        }
    }

    /// Size of the encoded header
    pub fn encoded_len(&self) -> usize {
        match self.piece {
            BlockPiece::Short => COMMON_HEADER_SIZE,
            BlockPiece::Start { .. } => self.family.start_header_len(),
            BlockPiece::Next { .. } => self.family.next_header_len(),
            BlockPiece::End { .. } => self.family.end_header_len(),
        }
    }

    /// Encode the header (big-endian fields)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_uint(u64::from(self.sender & 0x00FF_FFFF), 3);
        buf.put_u8(0);
        buf.put_u8(self.kind() as u8);
        buf.put_u8((self.family.block_type() << 4) | (self.block_number & 0x0F));

        let wide = self.family == FrameFamily::Bigger;
        match self.piece {
            BlockPiece::Short => {}
            BlockPiece::Start {
                total_len,
                piece_count,
            } => {
                if wide {
                    buf.put_uint(u64::from(total_len), 3);
                    buf.put_u16(piece_count);
                } else {
                    buf.put_u16(total_len as u16);
                    buf.put_u8(piece_count as u8);
                }
            }
            BlockPiece::Next { index } => {
                if wide {
                    buf.put_u16(index);
                } else {
                    buf.put_u8(index as u8);
                }
            }
            BlockPiece::End { checksum } => {
                if wide {
                    buf.put_u32(checksum);
                } else {
                    buf.put_u16(checksum as u16);
                }
            }
        }
    }

    /// Decode a header from the front of `buf`, leaving the carried data behind
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < COMMON_HEADER_SIZE {
            return Err(WireError::Incomplete {
                needed: COMMON_HEADER_SIZE,
                available: buf.len(),
            });
        }
        if buf[MARKER_OFFSET] != 0 {
            return Err(WireError::NotFragment);
        }

        let kind = FragmentKind::try_from(buf[4] & 0x0F)?;
        let block_type = buf[5] >> 4;
        let block_number = buf[5] & 0x0F;

        let family = FrameFamily::from_block_type(block_type)?;
        if family != kind.family() {
            return Err(WireError::BlockType(block_type));
        }
        if block_number == 0 {
            return Err(WireError::BlockNumber(block_number));
        }

        let header_len = match kind {
            FragmentKind::ShortBlock => COMMON_HEADER_SIZE,
            FragmentKind::StartBig | FragmentKind::StartBigger => family.start_header_len(),
            FragmentKind::NextBigPiece | FragmentKind::NextBiggerPiece => family.next_header_len(),
            FragmentKind::EndBigBlock | FragmentKind::EndBiggerBlock => family.end_header_len(),
        };
        if buf.len() < header_len {
            return Err(WireError::Incomplete {
                needed: header_len,
                available: buf.len(),
            });
        }

        let sender = buf.get_uint(3) as u32;
        buf.advance(3);

        let wide = family == FrameFamily::Bigger;
        let piece = match kind {
            FragmentKind::ShortBlock => BlockPiece::Short,
            FragmentKind::StartBig | FragmentKind::StartBigger => {
                if wide {
                    BlockPiece::Start {
                        total_len: buf.get_uint(3) as u32,
                        piece_count: buf.get_u16(),
                    }
                } else {
                    BlockPiece::Start {
                        total_len: u32::from(buf.get_u16()),
                        piece_count: u16::from(buf.get_u8()),
                    }
                }
            }
            FragmentKind::NextBigPiece | FragmentKind::NextBiggerPiece => BlockPiece::Next {
                index: if wide {
                    buf.get_u16()
                } else {
                    u16::from(buf.get_u8())
                },
            },
            FragmentKind::EndBigBlock | FragmentKind::EndBiggerBlock => BlockPiece::End {
                checksum: if wide {
                    buf.get_u32()
                } else {
                    u32::from(buf.get_u16())
                },
            },
        };

        Ok(Self {
            sender,
            family,
            block_number,
            piece,
        })
    }
}
