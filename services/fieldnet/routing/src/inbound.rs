//! Inbound frame handling on the ingress worker.
//!
//! Each received frame is either passed on (transit) or terminates here. A
//! terminating frame's sender is traced back through its hop pairs; the
//! payload is delivered directly or fed to the reassembler when it is a
//! long-telegram fragment.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use fieldnet_link::{IngressEvent, IngressHandler};
use fieldnet_longtel::{FragmentOutcome, Reassembler};
use fieldnet_topology::{DeviceAddr, Link, LinkFlags};
use fieldnet_wire::{is_long_telegram, Osi3Header, WireError};
use tracing::{debug, info, warn};

use crate::router::{NetworkState, Shared};
use crate::RoutingError;

/// Ingress-side protocol handler; the only writer of reassembly state
#[derive(Debug)]
pub struct InboundHandler {
    shared: Arc<Shared>,
    reassembler: Reassembler,
}

impl InboundHandler {
    pub(crate) fn new(shared: Arc<Shared>, reassembler: Reassembler) -> Self {
        Self {
            shared,
            reassembler,
        }
    }

    /// Route or deliver one frame received on a local port
    pub async fn on_frame_received(&mut self, port: u8, frame: Bytes) -> Result<(), RoutingError> {
        let state = self.shared.snapshot().await;
        let mut payload = frame;
        let mut header = Osi3Header::decode(&mut payload)?;

        if header.is_transit() && !self.shared.config.force_mirroring {
            return self.forward(&state, header, payload).await;
        }

        let inbound = inbound_link(&state, self.shared.local, port, &header)?;
        if header.pointer == 0 && header.length() > 0 {
            let mirrored = self.shared.config.force_mirroring
                || inbound
                    .flags
                    .intersects(LinkFlags::MIRRORED_RECEIVE | LinkFlags::REFLECT);
            if !mirrored {
                return Err(RoutingError::Unmirrored(inbound.key));
            }
            header.reflect();
        }

        let sender = state
            .topology
            .trace_sender(&header.hops, &inbound.key)
            .ok_or(RoutingError::UnknownSender(inbound.key))?;
        debug!(
            "Frame from {} on port {} ({} bytes, class {})",
            sender,
            port,
            payload.len(),
            header.priority.class()
        );
        self.on_telegram_received(sender, payload)
    }

    /// Deliver a decapsulated payload, reassembling long telegrams
    pub fn on_telegram_received(
        &mut self,
        sender: DeviceAddr,
        payload: Bytes,
    ) -> Result<(), RoutingError> {
        if !is_long_telegram(&payload) {
            self.shared.stats.delivered();
            self.shared.listeners.telegram(sender, payload, false);
            return Ok(());
        }

        match self.reassembler.on_fragment(payload)? {
            FragmentOutcome::Pending(_) => Ok(()),
            FragmentOutcome::Completed(key) => {
                let telegram = self.reassembler.take_completed(&key)?;
                debug!(
                    "Long telegram from {} complete ({} bytes)",
                    sender,
                    telegram.len()
                );
                self.shared.stats.reassembled();
                self.shared.stats.delivered();
                self.shared.listeners.telegram(sender, telegram, true);
                Ok(())
            }
        }
    }

    /// Report a link going up or down to the listeners
    pub async fn on_link_state_changed(&self, port: u8, connected: bool) {
        let state = self.shared.snapshot().await;
        let mut devices: Vec<DeviceAddr> = state
            .topology
            .links_on_port(self.shared.local, port)
            .map(|l| l.remote)
            .collect();
        devices.sort();
        devices.dedup();

        for device in devices {
            info!(
                "Link to device {} {}",
                device,
                if connected { "up" } else { "down" }
            );
            self.shared.listeners.link_state(device, connected);
        }
    }

    async fn forward(
        &self,
        state: &NetworkState,
        mut header: Osi3Header,
        payload: Bytes,
    ) -> Result<(), RoutingError> {
        let local = self.shared.local;
        let Some(hop) = header.current_hop() else {
            return Err(RoutingError::MalformedFrame(WireError::Pointer {
                pointer: header.pointer,
                length: header.length(),
            }));
        };

        let mut visited = HashSet::new();
        let resolution = state
            .topology
            .resolve_pair(local, hop, &mut visited)
            .ok_or(RoutingError::UnresolvedHop(hop))?;
        let outgoing = resolution.first;

        if !outgoing.flags.contains(LinkFlags::SUPPRESS_POINTER_INCREMENT) {
            header.advance();
        }

        let mut frame = BytesMut::with_capacity(header.encoded_len() + payload.len());
        header.encode(&mut frame);
        frame.put_slice(&payload);

        let layer = self.shared.link_layer(outgoing.key.port)?;
        layer.send(header.priority, frame.freeze()).await?;
        self.shared.stats.forwarded();
        debug!(
            "Forwarded {} bytes via {} (pointer {})",
            payload.len(),
            outgoing.key,
            header.pointer
        );
        Ok(())
    }
}

/// Link a terminating frame arrived on.
///
/// A port usually has a single partner. Otherwise the partner port is taken
/// from the hop pair that addressed us.
fn inbound_link<'a>(
    state: &'a NetworkState,
    local: DeviceAddr,
    port: u8,
    header: &Osi3Header,
) -> Result<&'a Link, RoutingError> {
    let mut candidates = state.topology.links_on_port(local, port);
    let first = candidates.next().ok_or(RoutingError::UnknownLink(port))?;
    if candidates.next().is_none() {
        return Ok(first);
    }

    let previous_port = if header.pointer == 0 {
        // mirrored order: our pair comes first, swapped
        header.hops.first().map(|h| h.remote_port)
    } else {
        header.hops.last().map(|h| h.local_port)
    };
    let previous_port = previous_port.ok_or(RoutingError::UnknownLink(port))?;

    state
        .topology
        .links_on_port(local, port)
        .find(|l| l.key.remote_port == previous_port)
        .ok_or(RoutingError::UnknownLink(port))
}

#[async_trait]
impl IngressHandler for InboundHandler {
    async fn handle(&mut self, event: IngressEvent) {
        match event {
            IngressEvent::Frame { port, frame } => {
                if let Err(e) = self.on_frame_received(port, frame).await {
                    warn!("Dropping frame on port {}: {}", port, e);
                    self.shared.stats.dropped(e.drop_reason());
                }
            }
            IngressEvent::Connected { port } => self.on_link_state_changed(port, true).await,
            IngressEvent::Disconnected { port } => {
                self.on_link_state_changed(port, false).await
            }
        }
    }
}
