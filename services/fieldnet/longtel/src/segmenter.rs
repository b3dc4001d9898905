//! Long-telegram segmenter.
//!
//! Every destination owns a window of block numbers 1..=15. [`Segmenter::submit`]
//! waits for a free number, turns the payload into a [`SegmentationSession`]
//! and queues it on the dispatch task. The dispatch task sends one piece per
//! live session per pass, round-robin, and returns the block number when a
//! session ends or its transmission fails.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use fieldnet_topology::DeviceAddr;
use fieldnet_wire::{
    BlockHeader, BlockPiece, FrameFamily, Priority, FRAME_BUDGET, MAX_BIGGER_TOTAL,
    MAX_BLOCK_NUMBER,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SegmentError;

/// Value written into the end piece's checksum slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Always zero
    #[default]
    Disabled,
    /// Fixed placeholder value, truncated to the field width
    Constant(u32),
}

impl ChecksumMode {
    fn value(self) -> u32 {
        match self {
            ChecksumMode::Disabled => 0,
            ChecksumMode::Constant(value) => value,
        }
    }
}

/// Segmenter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Largest OSI-7 piece handed to the frame sink; set from the router's
    /// budget, never read from configuration files
    #[serde(skip)]
    pub frame_budget: usize,
    /// Concurrent sessions per destination (at most 15)
    pub window: usize,
    /// End-piece checksum slot
    pub checksum: ChecksumMode,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            frame_budget: FRAME_BUDGET,
            window: MAX_BLOCK_NUMBER as usize,
            checksum: ChecksumMode::Disabled,
        }
    }
}

/// Destination for the pieces produced by the dispatch task
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Deliver one OSI-7 piece towards `destination`
    async fn transmit(
        &self,
        destination: DeviceAddr,
        priority: Priority,
        payload: Bytes,
    ) -> Result<(), SegmentError>;
}

/// Block-number pool and session counter of one destination
#[derive(Debug)]
struct Window {
    free_tx: mpsc::Sender<u8>,
    free_rx: Mutex<mpsc::Receiver<u8>>,
    in_flight: AtomicUsize,
}

impl Window {
    fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_BLOCK_NUMBER as usize);
        let (free_tx, free_rx) = mpsc::channel(size);
        for number in 1..=size as u8 {
            // capacity equals the number of block numbers
            let _ = free_tx.try_send(number);
        }
        Self {
            free_tx,
            free_rx: Mutex::new(free_rx),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Wait for the oldest free block number
    async fn acquire(self: &Arc<Self>) -> Result<BlockLease, SegmentError> {
        let mut free = self.free_rx.lock().await;
        let number = free.recv().await.ok_or(SegmentError::Closed)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(BlockLease {
            window: self.clone(),
            number,
        })
    }
}

/// A reserved block number, returned to its window on drop
#[derive(Debug)]
struct BlockLease {
    window: Arc<Window>,
    number: u8,
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        self.window.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.window.free_tx.try_send(self.number).is_err() {
            warn!("Block number {} could not be returned", self.number);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Next(u16),
    End,
    Done,
}

/// One long telegram being cut into pieces
#[derive(Debug)]
pub struct SegmentationSession {
    destination: DeviceAddr,
    priority: Priority,
    sender: u32,
    block_number: u8,
    family: FrameFamily,
    budget: usize,
    checksum: u32,
    payload: Bytes,
    offset: usize,
    piece_count: u16,
    stage: Stage,
    lease: Option<BlockLease>,
}

impl SegmentationSession {
    /// Plan a session for `payload`
    pub fn new(
        sender: DeviceAddr,
        destination: DeviceAddr,
        block_number: u8,
        priority: Priority,
        payload: Bytes,
        config: &SegmenterConfig,
    ) -> Result<Self, SegmentError> {
        let budget = config.frame_budget;
        if budget <= FrameFamily::Bigger.start_header_len() {
            return Err(SegmentError::FrameBudget(budget));
        }
        let family = FrameFamily::select(payload.len(), budget);
        let piece_count = plan_pieces(family, payload.len(), budget);

        if piece_count > family.max_pieces()
            || (family == FrameFamily::Bigger && payload.len() > MAX_BIGGER_TOTAL)
        {
            return Err(SegmentError::PayloadTooLarge { len: payload.len() });
        }

        Ok(Self {
            destination,
            priority,
            sender: u32::from(sender.0),
            block_number,
            family,
            budget,
            checksum: config.checksum.value(),
            payload,
            offset: 0,
            piece_count: piece_count as u16,
            stage: Stage::Start,
            lease: None,
        })
    }

    /// Frame family chosen for the payload
    pub fn family(&self) -> FrameFamily {
        self.family
    }

    /// Number of next pieces between start and end
    pub fn piece_count(&self) -> u16 {
        self.piece_count
    }

    /// Block number of the session
    pub fn block_number(&self) -> u8 {
        self.block_number
    }

    /// Whether every piece has been produced
    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Produce the next piece in order
    pub fn next_piece(&mut self) -> Option<Bytes> {
        let remaining = self.payload.len() - self.offset;
        let (piece, take) = match self.stage {
            Stage::Done => return None,
            Stage::Start if self.family == FrameFamily::Short => (BlockPiece::Short, remaining),
            Stage::Start => (
                BlockPiece::Start {
                    total_len: self.payload.len() as u32,
                    piece_count: self.piece_count,
                },
                remaining.min(self.budget - self.family.start_header_len()),
            ),
            Stage::Next(index) => (
                BlockPiece::Next { index },
                remaining.min(self.budget - self.family.next_header_len()),
            ),
            Stage::End => (
                BlockPiece::End {
                    checksum: self.checksum,
                },
                remaining,
            ),
        };

        let header = BlockHeader {
            sender: self.sender,
            family: self.family,
            block_number: self.block_number,
            piece,
        };
        let mut buf = BytesMut::with_capacity(header.encoded_len() + take);
        header.encode(&mut buf);
        buf.put_slice(&self.payload[self.offset..self.offset + take]);
        self.offset += take;

        self.stage = match self.stage {
            Stage::Start if self.family == FrameFamily::Short => Stage::Done,
            Stage::Start if self.piece_count > 0 => Stage::Next(1),
            Stage::Next(index) if index < self.piece_count => Stage::Next(index + 1),
            Stage::Start | Stage::Next(_) => Stage::End,
            Stage::End | Stage::Done => Stage::Done,
        };

        Some(buf.freeze())
    }
}

/// Number of next pieces needed for `len` bytes
fn plan_pieces(family: FrameFamily, len: usize, budget: usize) -> usize {
    if family == FrameFamily::Short {
        return 0;
    }
    let start = budget - family.start_header_len();
    let next = budget - family.next_header_len();
    let end = budget - family.end_header_len();

    let after_start = len.saturating_sub(start);
    if after_start <= end {
        0
    } else {
        (after_start - end).div_ceil(next)
    }
}

/// Cut a payload into its complete piece sequence without windowing
pub fn segment(
    sender: DeviceAddr,
    block_number: u8,
    payload: Bytes,
    config: &SegmenterConfig,
) -> Result<Vec<Bytes>, SegmentError> {
    let mut session = SegmentationSession::new(
        sender,
        sender,
        block_number,
        Priority::Normal,
        payload,
        config,
    )?;
    let mut pieces = Vec::with_capacity(session.piece_count() as usize + 2);
    while let Some(piece) = session.next_piece() {
        pieces.push(piece);
    }
    Ok(pieces)
}

/// Per-node segmenter front end
#[derive(Debug)]
pub struct Segmenter {
    local: DeviceAddr,
    config: SegmenterConfig,
    windows: DashMap<DeviceAddr, Arc<Window>>,
    sessions: mpsc::UnboundedSender<SegmentationSession>,
}

impl Segmenter {
    /// Create the segmenter and spawn its dispatch task
    pub fn spawn<S>(local: DeviceAddr, config: SegmenterConfig, sink: S) -> (Self, JoinHandle<()>)
    where
        S: FrameSink,
    {
        let (sessions, queue) = mpsc::unbounded_channel();
        let dispatch = tokio::spawn(dispatch_loop(local, queue, sink));
        info!(
            "Segmenter for device {} started (window {}, budget {})",
            local, config.window, config.frame_budget
        );
        (
            Self {
                local,
                config,
                windows: DashMap::new(),
                sessions,
            },
            dispatch,
        )
    }

    /// Queue a long telegram for `destination`.
    ///
    /// Waits while all block numbers of the destination are in use. Returns
    /// the block number assigned to the session.
    pub async fn submit(
        &self,
        destination: DeviceAddr,
        payload: Bytes,
        priority: Priority,
    ) -> Result<u8, SegmentError> {
        // reject before taking a block number
        let mut session =
            SegmentationSession::new(self.local, destination, 0, priority, payload, &self.config)?;

        let window = self
            .windows
            .entry(destination)
            .or_insert_with(|| Arc::new(Window::new(self.config.window)))
            .clone();
        let lease = window.acquire().await?;
        let number = lease.number;

        session.block_number = number;
        session.lease = Some(lease);
        debug!(
            "Queued {:?} block {} to {} ({} bytes, {} pieces)",
            session.family,
            number,
            destination,
            session.payload.len(),
            session.piece_count
        );

        self.sessions.send(session).map_err(|_| SegmentError::Closed)?;
        Ok(number)
    }

    /// Live sessions towards `destination`
    pub fn in_flight(&self, destination: DeviceAddr) -> usize {
        self.windows
            .get(&destination)
            .map(|w| w.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Active configuration
    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }
}

async fn dispatch_loop<S: FrameSink>(
    local: DeviceAddr,
    mut queue: mpsc::UnboundedReceiver<SegmentationSession>,
    sink: S,
) {
    let mut live: VecDeque<SegmentationSession> = VecDeque::new();

    loop {
        if live.is_empty() {
            match queue.recv().await {
                Some(session) => live.push_back(session),
                None => break,
            }
        }
        while let Ok(session) = queue.try_recv() {
            live.push_back(session);
        }

        for _ in 0..live.len() {
            let Some(mut session) = live.pop_front() else {
                break;
            };
            let Some(piece) = session.next_piece() else {
                continue;
            };

            match sink
                .transmit(session.destination, session.priority, piece)
                .await
            {
                Ok(()) if session.is_done() => {
                    debug!(
                        "Block {} to {} complete",
                        session.block_number, session.destination
                    );
                }
                Ok(()) => live.push_back(session),
                Err(e) => {
                    warn!(
                        "Dropping block {} to {}: {}",
                        session.block_number, session.destination, e
                    );
                }
            }
        }
    }

    info!("Segmenter dispatch loop for device {} stopped", local);
}
