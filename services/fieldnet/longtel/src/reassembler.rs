//! Long-telegram reassembly.
//!
//! Sessions are keyed by sender, block type and block number. A session is
//! opened by a start (or short) fragment and grows until its end fragment
//! arrives; any out-of-order piece discards it. The reassembler is owned by
//! the ingress worker and needs no locking.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use fieldnet_wire::{
    big_capacity, BlockHeader, BlockPiece, FrameFamily, FRAME_BUDGET, MAX_BIGGER_TOTAL,
};
use tracing::{debug, warn};

use crate::{ReassemblyError, Violation};

/// Identity of a reassembly session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Sender address from the fragment header
    pub sender: u32,
    /// Block family (block type nibble)
    pub family: FrameFamily,
    /// Block number 1..=15
    pub block_number: u8,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{:?}/{}",
            self.sender, self.family, self.block_number
        )
    }
}

/// Reassembler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Discard sessions idle for longer than this; `None` keeps them forever
    pub session_timeout: Option<Duration>,
    /// Frame budget shared by every sender on the network; bounds what a
    /// start piece may announce
    pub frame_budget: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            session_timeout: None,
            frame_budget: FRAME_BUDGET,
        }
    }
}

/// Result of feeding one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// The session needs more pieces
    Pending(SessionKey),
    /// The session is complete and can be taken
    Completed(SessionKey),
}

#[derive(Debug)]
struct ReassemblySession {
    buffer: BytesMut,
    total_len: usize,
    expected_pieces: u16,
    received: u16,
    finished: bool,
    last_seen: Instant,
}

/// Per-node reassembly state
#[derive(Debug, Default)]
pub struct Reassembler {
    config: ReassemblyConfig,
    sessions: HashMap<SessionKey, ReassemblySession>,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// Number of open sessions, finished ones included
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Feed one fragment
    pub fn on_fragment(&mut self, fragment: Bytes) -> Result<FragmentOutcome, ReassemblyError> {
        self.on_fragment_at(fragment, Instant::now())
    }

    /// Feed one fragment observed at `now`
    pub fn on_fragment_at(
        &mut self,
        mut fragment: Bytes,
        now: Instant,
    ) -> Result<FragmentOutcome, ReassemblyError> {
        self.prune(now);

        let header = BlockHeader::decode(&mut fragment)?;
        let key = SessionKey {
            sender: header.sender,
            family: header.family,
            block_number: header.block_number,
        };

        match header.piece {
            BlockPiece::Short => {
                self.replace(key);
                self.sessions.insert(
                    key,
                    ReassemblySession {
                        total_len: fragment.len(),
                        buffer: BytesMut::from(&fragment[..]),
                        expected_pieces: 0,
                        received: 0,
                        finished: true,
                        last_seen: now,
                    },
                );
                Ok(FragmentOutcome::Completed(key))
            }
            BlockPiece::Start {
                total_len,
                piece_count,
            } => {
                self.replace(key);
                let total_len = total_len as usize;
                if !self.announcement_fits(header.family, total_len, piece_count) {
                    return Err(self.violation(
                        key,
                        Violation::Announcement {
                            total_len,
                            piece_count,
                        },
                    ));
                }
                if fragment.len() > total_len {
                    return Err(self.violation(
                        key,
                        Violation::Length {
                            expected: total_len,
                            got: fragment.len(),
                        },
                    ));
                }
                self.sessions.insert(
                    key,
                    ReassemblySession {
                        buffer: BytesMut::from(&fragment[..]),
                        total_len,
                        expected_pieces: piece_count,
                        received: 0,
                        finished: false,
                        last_seen: now,
                    },
                );
                debug!(
                    "Opened session {} ({} bytes, {} pieces)",
                    key, total_len, piece_count
                );
                Ok(FragmentOutcome::Pending(key))
            }
            BlockPiece::Next { index } => {
                let session = self.open_session(key)?;
                let expected = session.received.saturating_add(1);
                if index != expected || session.received >= session.expected_pieces {
                    return Err(self.violation(
                        key,
                        Violation::PieceIndex {
                            expected,
                            got: index,
                        },
                    ));
                }
                session.received = index;
                session.buffer.extend_from_slice(&fragment);
                session.last_seen = now;
                let (got, expected) = (session.buffer.len(), session.total_len);
                if got > expected {
                    return Err(self.violation(key, Violation::Length { expected, got }));
                }
                Ok(FragmentOutcome::Pending(key))
            }
            BlockPiece::End { .. } => {
                let session = self.open_session(key)?;
                if session.received != session.expected_pieces {
                    let violation = Violation::PieceCount {
                        expected: session.expected_pieces,
                        got: session.received,
                    };
                    return Err(self.violation(key, violation));
                }
                session.buffer.extend_from_slice(&fragment);
                session.last_seen = now;
                let (got, expected) = (session.buffer.len(), session.total_len);
                if got != expected {
                    return Err(self.violation(key, Violation::Length { expected, got }));
                }
                session.finished = true;
                debug!("Session {} complete ({} bytes)", key, got);
                Ok(FragmentOutcome::Completed(key))
            }
        }
    }

    /// Remove and return a finished session's payload
    pub fn take_completed(&mut self, key: &SessionKey) -> Result<Bytes, ReassemblyError> {
        match self.sessions.get(key) {
            None => Err(ReassemblyError::UnknownSession(*key)),
            Some(session) if !session.finished => Err(ReassemblyError::NotFinished(*key)),
            Some(_) => self
                .sessions
                .remove(key)
                .map(|session| session.buffer.freeze())
                .ok_or(ReassemblyError::UnknownSession(*key)),
        }
    }

    /// Session that accepts continuation pieces
    fn open_session(&mut self, key: SessionKey) -> Result<&mut ReassemblySession, ReassemblyError> {
        match self.sessions.get(&key).map(|s| s.finished) {
            None => Err(self.violation(key, Violation::Orphan)),
            Some(true) => Err(self.violation(key, Violation::AlreadyFinished)),
            Some(false) => self
                .sessions
                .get_mut(&key)
                .ok_or(ReassemblyError::UnknownSession(key)),
        }
    }

    /// Whether a sender using our frame budget could have produced this
    /// start piece. The buffer grows piece by piece, but an impossible
    /// announcement is refused before any session state exists.
    fn announcement_fits(&self, family: FrameFamily, total_len: usize, piece_count: u16) -> bool {
        let budget = self.config.frame_budget;
        if budget <= FrameFamily::Bigger.start_header_len() {
            return false;
        }
        let within_family = match family {
            FrameFamily::Short => false,
            FrameFamily::Big => total_len < big_capacity(budget),
            FrameFamily::Bigger => total_len <= MAX_BIGGER_TOTAL,
        };
        let pieces = usize::from(piece_count);
        let carried = budget.saturating_sub(family.start_header_len())
            + pieces * budget.saturating_sub(family.next_header_len())
            + budget.saturating_sub(family.end_header_len());
        within_family && pieces <= family.max_pieces() && total_len <= carried
    }

    fn replace(&mut self, key: SessionKey) {
        if self.sessions.remove(&key).is_some() {
            warn!("Session {} restarted by sender, previous data discarded", key);
        }
    }

    fn violation(&mut self, key: SessionKey, violation: Violation) -> ReassemblyError {
        self.sessions.remove(&key);
        warn!("Discarding session {}: {}", key, violation);
        ReassemblyError::SequenceViolation { key, violation }
    }

    fn prune(&mut self, now: Instant) {
        let Some(timeout) = self.config.session_timeout else {
            return;
        };
        self.sessions.retain(|key, session| {
            let stale = !session.finished && now.duration_since(session.last_seen) > timeout;
            if stale {
                warn!("Session {} timed out", key);
            }
            !stale
        });
    }
}
