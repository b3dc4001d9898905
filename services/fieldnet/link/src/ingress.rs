//! Asynchronous ingress pipeline.
//!
//! Link layers never call into the router directly. They push events into
//! bounded queues and a single worker task hands them, in order, to an
//! [`IngressHandler`]. Producers wait when a queue is full; nothing is
//! dropped.

use async_trait::async_trait;
use bytes::Bytes;
use fieldnet_wire::Priority;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::LinkError;

/// Default capacity of each class queue
pub const DEFAULT_INGRESS_CAPACITY: usize = 2000;

/// Event delivered by a link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressEvent {
    /// A frame arrived on a local port
    Frame {
        /// Local port the frame arrived on
        port: u8,
        /// Raw frame, OSI-3 header included
        frame: Bytes,
    },
    /// The link on a local port came up
    Connected {
        /// Local port
        port: u8,
    },
    /// The link on a local port went down
    Disconnected {
        /// Local port
        port: u8,
    },
}

/// Consumer of ingress events, owned by the worker task
#[async_trait]
pub trait IngressHandler: Send + 'static {
    /// Process one event
    async fn handle(&mut self, event: IngressEvent);
}

/// Ingress pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Capacity of each class queue
    pub capacity: usize,
    /// Serve urgent frames before normal ones
    pub prioritize: bool,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_INGRESS_CAPACITY,
            prioritize: false,
        }
    }
}

/// Producer handle given to link layers
#[derive(Debug, Clone)]
pub struct IngressSender {
    urgent: mpsc::Sender<IngressEvent>,
    normal: mpsc::Sender<IngressEvent>,
    prioritize: bool,
}

impl IngressSender {
    /// Queue a received frame
    pub async fn data_received(&self, port: u8, frame: Bytes) -> Result<(), LinkError> {
        let urgent = self.prioritize
            && frame
                .first()
                .is_some_and(|&control| Priority::from_control(control) == Priority::Urgent);
        let queue = if urgent { &self.urgent } else { &self.normal };
        queue
            .send(IngressEvent::Frame { port, frame })
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Queue a link-up notification
    pub async fn connected(&self, port: u8) -> Result<(), LinkError> {
        self.normal
            .send(IngressEvent::Connected { port })
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Queue a link-down notification
    pub async fn disconnected(&self, port: u8) -> Result<(), LinkError> {
        self.normal
            .send(IngressEvent::Disconnected { port })
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Whether the worker has stopped
    pub fn is_closed(&self) -> bool {
        self.normal.is_closed()
    }
}

/// Ingress worker bootstrap
pub struct IngressPipeline;

impl IngressPipeline {
    /// Spawn the worker task.
    ///
    /// The worker runs until every [`IngressSender`] clone is dropped and both
    /// queues are drained.
    pub fn spawn<H>(config: &IngressConfig, mut handler: H) -> (IngressSender, JoinHandle<()>)
    where
        H: IngressHandler,
    {
        let capacity = config.capacity.max(1);
        let (urgent_tx, mut urgent_rx) = mpsc::channel(capacity);
        let (normal_tx, mut normal_rx) = mpsc::channel(capacity);

        let sender = IngressSender {
            urgent: urgent_tx,
            normal: normal_tx,
            prioritize: config.prioritize,
        };

        info!(
            "Starting ingress worker (capacity {}, prioritize {})",
            capacity, config.prioritize
        );

        let worker = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    Some(event) = urgent_rx.recv() => event,
                    Some(event) = normal_rx.recv() => event,
                    else => break,
                };
                debug!("Ingress event: {:?}", event);
                handler.handle(event).await;
            }
            info!("Ingress worker stopped");
        });

        (sender, worker)
    }
}
