//! OSI-3 routing header processing.
//!
//! Every frame on a field link starts with a control byte followed by up to
//! seven hop pairs. The control byte packs the traversal pointer, the number
//! of hop pairs and the priority class:
//!
//! ```text
//!  bit  7   6   5   4   3   2   1   0
//!     +---+---+---+---+---+---+---+---+
//!     | P | - |  length   |  pointer  |
//!     +---+---+---+---+---+---+---+---+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::WireError;

/// Maximum number of hop pairs in one header
pub const MAX_HOPS: usize = 7;

/// Maximum encoded header size in bytes
pub const MAX_HEADER_SIZE: usize = 1 + 2 * MAX_HOPS;

const POINTER_MASK: u8 = 0x07;
const LENGTH_SHIFT: u8 = 3;
const PRIORITY_BIT: u8 = 0x80;

/// Priority class of a frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Class 1, priority bit clear
    #[default]
    Normal = 1,
    /// Class 2, priority bit set
    Urgent = 2,
}

impl TryFrom<u8> for Priority {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::Urgent),
            _ => Err(WireError::Priority(value)),
        }
    }
}

impl Priority {
    /// Priority class encoded in a control byte
    pub fn from_control(control: u8) -> Self {
        if control & PRIORITY_BIT != 0 {
            Priority::Urgent
        } else {
            Priority::Normal
        }
    }

    /// Numeric class (1 or 2)
    pub fn class(self) -> u8 {
        self as u8
    }
}

/// One addressed hop: the port a frame leaves on and the port it enters on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopPair {
    /// Outgoing port on the sending device
    pub local_port: u8,
    /// Incoming port on the receiving device
    pub remote_port: u8,
}

impl HopPair {
    /// Create a new hop pair
    pub fn new(local_port: u8, remote_port: u8) -> Self {
        Self {
            local_port,
            remote_port,
        }
    }

    /// The same hop seen from the other end
    pub fn swapped(self) -> Self {
        Self {
            local_port: self.remote_port,
            remote_port: self.local_port,
        }
    }
}

/// Decoded OSI-3 routing header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Osi3Header {
    /// Priority class (bit 7 of the control byte)
    pub priority: Priority,
    /// Traversal pointer (bits 0..2)
    pub pointer: u8,
    /// Hop pairs in forward order
    pub hops: SmallVec<[HopPair; MAX_HOPS]>,
}

impl Osi3Header {
    /// Build a sender-side header. The sender consumes the first hop itself,
    /// so the pointer starts at 1 (or 0 when there are no hops).
    pub fn new<I>(hops: I) -> Result<Self, WireError>
    where
        I: IntoIterator<Item = HopPair>,
    {
        let hops: SmallVec<[HopPair; MAX_HOPS]> = hops.into_iter().collect();
        if hops.len() > MAX_HOPS {
            return Err(WireError::TooManyHops {
                hops: hops.len(),
                max: MAX_HOPS,
            });
        }
        let pointer = u8::from(!hops.is_empty());
        Ok(Self {
            priority: Priority::Normal,
            pointer,
            hops,
        })
    }

    /// Header collapsed to a single control byte (no hops, pointer 0)
    pub fn control_byte_only(priority: Priority) -> Self {
        Self {
            priority,
            pointer: 0,
            hops: SmallVec::new(),
        }
    }

    /// Set the priority class
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Number of hop pairs (the length field)
    pub fn length(&self) -> u8 {
        self.hops.len() as u8
    }

    /// Size of the encoded header in bytes
    pub fn encoded_len(&self) -> usize {
        1 + 2 * self.hops.len()
    }

    /// Encode the control byte
    pub fn control_byte(&self) -> u8 {
        let mut control = (self.pointer & POINTER_MASK) | ((self.length() & 0x07) << LENGTH_SHIFT);
        if self.priority == Priority::Urgent {
            control |= PRIORITY_BIT;
        }
        control
    }

    /// Encode the header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.control_byte());
        for hop in &self.hops {
            buf.put_u8(hop.local_port);
            buf.put_u8(hop.remote_port);
        }
    }

    /// Decode a header from the front of `buf`, leaving the payload behind
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.is_empty() {
            return Err(WireError::Incomplete {
                needed: 1,
                available: 0,
            });
        }

        let control = buf[0];
        let pointer = control & POINTER_MASK;
        let length = (control >> LENGTH_SHIFT) & 0x07;
        let needed = 1 + 2 * length as usize;

        if buf.len() < needed {
            return Err(WireError::Incomplete {
                needed,
                available: buf.len(),
            });
        }
        if pointer > length {
            return Err(WireError::Pointer { pointer, length });
        }

        buf.advance(1);
        let hops = (0..length)
            .map(|_| {
                let local_port = buf.get_u8();
                let remote_port = buf.get_u8();
                HopPair::new(local_port, remote_port)
            })
            .collect();

        Ok(Self {
            priority: Priority::from_control(control),
            pointer,
            hops,
        })
    }

    /// Whether a device seeing this header must pass the frame on
    pub fn is_transit(&self) -> bool {
        self.pointer > 0 && self.pointer < self.length()
    }

    /// Hop pair the current device must send on, if any
    pub fn current_hop(&self) -> Option<HopPair> {
        self.hops.get(self.pointer as usize).copied()
    }

    /// Move the traversal pointer one hop forward
    pub fn advance(&mut self) {
        if self.pointer < self.length() {
            self.pointer += 1;
        }
    }

    /// Turn a mirrored header back into forward order.
    ///
    /// Mirroring peers hand over the return path: hop pairs reversed, each
    /// pair swapped, pointer 0. Reflecting it yields the forward path as the
    /// original sender wrote it, with the pointer at the end.
    pub fn reflect(&mut self) {
        self.hops.reverse();
        for hop in self.hops.iter_mut() {
            *hop = hop.swapped();
        }
        self.pointer = self.length();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Osi3Header {
        Osi3Header::new([HopPair::new(1, 1), HopPair::new(2, 1)]).unwrap()
    }

    #[test]
    fn test_priority_conversion() {
        assert_eq!(Priority::try_from(1).unwrap(), Priority::Normal);
        assert_eq!(Priority::try_from(2).unwrap(), Priority::Urgent);
        assert!(Priority::try_from(3).is_err());
        assert_eq!(Priority::from_control(0x80), Priority::Urgent);
        assert_eq!(Priority::from_control(0x11), Priority::Normal);
    }

    #[test]
    fn test_control_byte_layout() {
        let header = chain().with_priority(Priority::Urgent);
        // pointer 1, length 2, priority bit
        assert_eq!(header.control_byte(), 0x80 | (2 << 3) | 1);
        assert_eq!(header.encoded_len(), 5);
    }

    #[test]
    fn test_header_encode_decode() {
        let header = chain().with_priority(Priority::Urgent);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.put_slice(b"payload");

        let mut bytes = buf.freeze();
        let decoded = Osi3Header::decode(&mut bytes).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(&bytes[..], b"payload");
    }

    #[test]
    fn test_too_many_hops() {
        let hops = (1..=8).map(|p| HopPair::new(p, p));
        assert!(matches!(
            Osi3Header::new(hops),
            Err(WireError::TooManyHops { hops: 8, max: 7 })
        ));

        let hops = (1..=7).map(|p| HopPair::new(p, p));
        let header = Osi3Header::new(hops).unwrap();
        assert_eq!(header.encoded_len(), MAX_HEADER_SIZE);
    }

    #[test]
    fn test_decode_rejects_truncated_and_bad_pointer() {
        // length 2 but only one pair present
        let mut truncated = Bytes::from_static(&[(2 << 3) | 1, 1, 1]);
        assert!(matches!(
            Osi3Header::decode(&mut truncated),
            Err(WireError::Incomplete { needed: 5, available: 3 })
        ));

        // pointer 3 with length 1
        let mut bad_pointer = Bytes::from_static(&[(1 << 3) | 3, 1, 1]);
        assert!(matches!(
            Osi3Header::decode(&mut bad_pointer),
            Err(WireError::Pointer { pointer: 3, length: 1 })
        ));

        let mut empty = Bytes::new();
        assert!(Osi3Header::decode(&mut empty).is_err());
    }

    #[test]
    fn test_transit_and_advance() {
        let mut header = chain();
        assert!(header.is_transit());
        assert_eq!(header.current_hop(), Some(HopPair::new(2, 1)));

        header.advance();
        assert_eq!(header.pointer, 2);
        assert!(!header.is_transit());
        assert_eq!(header.current_hop(), None);

        // pointer never runs past the length
        header.advance();
        assert_eq!(header.pointer, 2);
    }

    #[test]
    fn test_reflect_restores_forward_order() {
        let mut mirrored = Osi3Header {
            priority: Priority::Normal,
            pointer: 0,
            hops: [HopPair::new(1, 2), HopPair::new(1, 1)].into_iter().collect(),
        };
        mirrored.reflect();

        assert_eq!(mirrored.pointer, 2);
        assert_eq!(&mirrored.hops[..], &chain().hops[..]);
    }

    #[test]
    fn test_control_byte_only() {
        let header = Osi3Header::control_byte_only(Priority::Urgent);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[0x80]);
        assert_eq!(Osi3Header::new([]).unwrap().pointer, 0);
    }
}
