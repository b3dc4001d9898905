//! Router statistics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reason an inbound frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Header or payload could not be decoded
    Malformed,
    /// Pointer-0 header on a link without mirroring
    Unmirrored,
    /// Transit hop did not resolve
    NoRoute,
    /// Inbound link or sender could not be determined
    UnknownOrigin,
    /// Long-telegram session discarded
    SequenceViolation,
    /// Onward transmission failed
    TransmitFailure,
    /// Configuration problem surfaced at runtime
    Configuration,
}

impl DropReason {
    const ALL: [DropReason; 7] = [
        DropReason::Malformed,
        DropReason::Unmirrored,
        DropReason::NoRoute,
        DropReason::UnknownOrigin,
        DropReason::SequenceViolation,
        DropReason::TransmitFailure,
        DropReason::Configuration,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed => write!(f, "malformed frame"),
            DropReason::Unmirrored => write!(f, "unreflected mirrored header"),
            DropReason::NoRoute => write!(f, "no route for transit hop"),
            DropReason::UnknownOrigin => write!(f, "unknown origin"),
            DropReason::SequenceViolation => write!(f, "long-telegram sequence violation"),
            DropReason::TransmitFailure => write!(f, "transmit failure"),
            DropReason::Configuration => write!(f, "configuration error"),
        }
    }
}

/// Live counters, updated from the send path and the ingress worker
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    telegrams_sent: AtomicU64,
    long_telegrams_sent: AtomicU64,
    loopback: AtomicU64,
    frames_forwarded: AtomicU64,
    telegrams_delivered: AtomicU64,
    long_telegrams_reassembled: AtomicU64,
    dropped: [AtomicU64; 7],
}

impl StatsCounters {
    pub(crate) fn sent(&self) {
        self.telegrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sent_long(&self) {
        self.long_telegrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn looped_back(&self) {
        self.loopback.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.telegrams_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reassembled(&self) {
        self.long_telegrams_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self, reason: DropReason) {
        self.dropped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, local: u8, routes: usize) -> RouterStats {
        let drop_reasons: HashMap<String, u64> = DropReason::ALL
            .iter()
            .map(|&r| (r, self.dropped[r.index()].load(Ordering::Relaxed)))
            .filter(|&(_, n)| n > 0)
            .map(|(r, n)| (r.to_string(), n))
            .collect();

        RouterStats {
            local_device: local,
            total_routes: routes,
            telegrams_sent: self.telegrams_sent.load(Ordering::Relaxed),
            long_telegrams_sent: self.long_telegrams_sent.load(Ordering::Relaxed),
            loopback: self.loopback.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            telegrams_delivered: self.telegrams_delivered.load(Ordering::Relaxed),
            long_telegrams_reassembled: self.long_telegrams_reassembled.load(Ordering::Relaxed),
            frames_dropped: drop_reasons.values().sum(),
            drop_reasons,
        }
    }
}

/// Router statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Local device address
    pub local_device: u8,
    /// Number of reachable destinations
    pub total_routes: usize,
    /// Single-frame telegrams sent
    pub telegrams_sent: u64,
    /// Long telegrams handed to the segmenter
    pub long_telegrams_sent: u64,
    /// Telegrams delivered to ourselves
    pub loopback: u64,
    /// Transit frames passed on
    pub frames_forwarded: u64,
    /// Telegrams handed to listeners (long ones included)
    pub telegrams_delivered: u64,
    /// Long telegrams completed by the reassembler
    pub long_telegrams_reassembled: u64,
    /// Inbound frames dropped
    pub frames_dropped: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

impl RouterStats {
    /// Drops booked under `reason`
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drop_reasons
            .get(&reason.to_string())
            .copied()
            .unwrap_or(0)
    }
}
