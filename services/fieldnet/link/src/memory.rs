//! In-process link protocol.
//!
//! Two [`MemoryLink`] instances naming the same `channel` property form one
//! point-to-point link. Endpoints meet on a process-wide hub; the second to
//! join brings the link up on both sides, and stopping either end takes it
//! down for the peer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fieldnet_wire::Priority;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{ConfigurationError, IngressSender, LinkError, LinkLayer, LinkSettings};

/// Protocol identifier of the in-memory link
pub const PROTOCOL: &str = "memory";

/// Property naming the shared channel
pub const CHANNEL_PROPERTY: &str = "channel";

/// Process-wide meeting point of memory link endpoints
static HUB: Lazy<MemoryHub> = Lazy::new(MemoryHub::default);

#[derive(Debug, Clone)]
struct Endpoint {
    id: u64,
    port: u8,
    ingress: IngressSender,
    connected: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MemoryHub {
    channels: Mutex<HashMap<String, Vec<Endpoint>>>,
    next_id: AtomicU64,
}

impl MemoryHub {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Join a channel, returning the peer already waiting there
    async fn join(&self, channel: &str, endpoint: Endpoint) -> Result<Option<Endpoint>, LinkError> {
        let mut channels = self.channels.lock().await;
        let members = channels.entry(channel.to_string()).or_default();
        if members.len() >= 2 {
            return Err(LinkError::ChannelFull(channel.to_string()));
        }
        let peer = members.first().cloned();
        if let Some(peer) = &peer {
            peer.connected.store(true, Ordering::SeqCst);
            endpoint.connected.store(true, Ordering::SeqCst);
        }
        members.push(endpoint);
        Ok(peer)
    }

    /// Leave a channel, returning the peer left behind
    async fn leave(&self, channel: &str, id: u64) -> Option<Endpoint> {
        let mut channels = self.channels.lock().await;
        let members = channels.get_mut(channel)?;
        members.retain(|e| e.id != id);
        let peer = members.first().cloned();
        if let Some(peer) = &peer {
            peer.connected.store(false, Ordering::SeqCst);
        }
        if members.is_empty() {
            channels.remove(channel);
        }
        peer
    }

    async fn peer(&self, channel: &str, id: u64) -> Option<Endpoint> {
        let channels = self.channels.lock().await;
        channels
            .get(channel)?
            .iter()
            .find(|e| e.id != id)
            .cloned()
    }
}

/// Link endpoint on an in-process channel
#[derive(Debug)]
pub struct MemoryLink {
    id: u64,
    port: u8,
    channel: String,
    properties: BTreeMap<String, String>,
    started: AtomicBool,
    connected: Arc<AtomicBool>,
}

impl MemoryLink {
    /// Factory registered under [`PROTOCOL`]
    pub fn create(settings: LinkSettings) -> Result<Arc<dyn LinkLayer>, ConfigurationError> {
        let channel = settings
            .properties
            .get(CHANNEL_PROPERTY)
            .cloned()
            .ok_or_else(|| ConfigurationError::MissingProperty {
                protocol: PROTOCOL.to_string(),
                port: settings.port,
                name: CHANNEL_PROPERTY.to_string(),
            })?;

        Ok(Arc::new(Self {
            id: HUB.allocate_id(),
            port: settings.port,
            channel,
            properties: settings.properties,
            started: AtomicBool::new(false),
            connected: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl LinkLayer for MemoryLink {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    fn port(&self) -> u8 {
        self.port
    }

    fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(&self, ingress: IngressSender) -> Result<(), LinkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LinkError::AlreadyStarted(self.port));
        }

        let endpoint = Endpoint {
            id: self.id,
            port: self.port,
            ingress: ingress.clone(),
            connected: self.connected.clone(),
        };
        let peer = match HUB.join(&self.channel, endpoint).await {
            Ok(peer) => peer,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        match peer {
            Some(peer) => {
                info!("Memory channel {} connected", self.channel);
                ingress.connected(self.port).await?;
                if let Err(e) = peer.ingress.connected(peer.port).await {
                    warn!("Peer on channel {} missed link-up: {}", self.channel, e);
                }
            }
            None => debug!("Waiting for peer on memory channel {}", self.channel),
        }
        Ok(())
    }

    async fn send(&self, priority: Priority, frame: Bytes) -> Result<(), LinkError> {
        let peer = HUB
            .peer(&self.channel, self.id)
            .await
            .ok_or_else(|| LinkError::NotConnected {
                protocol: PROTOCOL.to_string(),
                port: self.port,
            })?;

        debug!(
            "Memory channel {}: {} bytes, class {}",
            self.channel,
            frame.len(),
            priority.class()
        );
        peer.ingress.data_received(peer.port, frame).await
    }

    async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Some(peer) = HUB.leave(&self.channel, self.id).await {
            info!("Memory channel {} disconnected", self.channel);
            if let Err(e) = peer.ingress.disconnected(peer.port).await {
                warn!("Peer on channel {} missed link-down: {}", self.channel, e);
            }
        }
    }
}
