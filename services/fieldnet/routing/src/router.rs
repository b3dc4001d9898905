//! OSI-3 router.
//!
//! The router owns the route table, the link layers of all locally terminated
//! ports, the segmenter and the ingress worker. Route state is published as an
//! immutable snapshot and replaced as a whole when the topology is reloaded.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use fieldnet_link::{
    IngressConfig, IngressPipeline, IngressSender, LinkLayer, LinkSettings, ProtocolRegistry,
};
use fieldnet_longtel::{
    FrameSink, Reassembler, ReassemblyConfig, SegmentError, Segmenter, SegmenterConfig,
};
use fieldnet_topology::{
    DeviceAddr, LinkFlags, LinkKey, Route, RouteTable, Topology, TopologyDescription,
};
use fieldnet_wire::{FrameFamily, Osi3Header, Priority, FRAME_BUDGET};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::inbound::InboundHandler;
use crate::listener::{ListenerId, Listeners, TelegramListener};
use crate::stats::{RouterStats, StatsCounters};
use crate::RoutingError;

/// Link-layer property enabling reflection of pointer-0 headers
pub const REFLECT_PROPERTY: &str = "reflect";

/// Link-layer property collapsing outgoing headers to the control byte
pub const REDUCE_PROPERTY: &str = "reduce_to_control_byte";

/// Router configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Treat every received frame as addressed to us
    pub force_mirroring: bool,
    /// Largest OSI-7 payload carried by one frame. Overrides the budgets of
    /// the segmenter and reassembler settings when the router starts.
    pub frame_budget: usize,
    /// Segmenter settings
    pub segmenter: SegmenterConfig,
    /// Reassembler settings
    pub reassembly: ReassemblyConfig,
    /// Ingress pipeline settings
    pub ingress: IngressConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            force_mirroring: false,
            frame_budget: FRAME_BUDGET,
            segmenter: SegmenterConfig::default(),
            reassembly: ReassemblyConfig::default(),
            ingress: IngressConfig::default(),
        }
    }
}

/// Topology and routes valid at one point in time
#[derive(Debug)]
pub(crate) struct NetworkState {
    pub(crate) topology: Topology,
    pub(crate) routes: RouteTable,
}

/// State shared by the send path, the dispatch task and the ingress worker
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) local: DeviceAddr,
    pub(crate) config: RouterConfig,
    state: RwLock<Arc<NetworkState>>,
    pub(crate) links: DashMap<u8, Arc<dyn LinkLayer>>,
    pub(crate) listeners: Listeners,
    pub(crate) stats: StatsCounters,
}

impl Shared {
    pub(crate) async fn snapshot(&self) -> Arc<NetworkState> {
        self.state.read().await.clone()
    }

    pub(crate) fn link_layer(&self, port: u8) -> Result<Arc<dyn LinkLayer>, RoutingError> {
        self.links
            .get(&port)
            .map(|l| l.value().clone())
            .ok_or(RoutingError::NoLinkLayer(port))
    }
}

/// Sends single frames along precomputed routes.
///
/// Used directly for short telegrams and as the segmenter's frame sink.
#[derive(Debug, Clone)]
pub struct Transmitter {
    shared: Arc<Shared>,
}

impl Transmitter {
    /// Prefix `payload` with the route header and hand it to the first-hop link
    pub async fn send_frame(
        &self,
        destination: DeviceAddr,
        priority: Priority,
        payload: Bytes,
    ) -> Result<(), RoutingError> {
        let state = self.shared.snapshot().await;
        let (header, first_hop) = outbound(&state, destination, priority)?;

        let mut frame = BytesMut::with_capacity(header.encoded_len() + payload.len());
        header.encode(&mut frame);
        frame.put_slice(&payload);

        let layer = self.shared.link_layer(first_hop.port)?;
        debug!(
            "Sending {} bytes to {} via {}",
            frame.len(),
            destination,
            first_hop
        );
        layer.send(priority, frame.freeze()).await?;
        Ok(())
    }
}

/// Header and first-hop link for a frame to `destination`
fn outbound(
    state: &NetworkState,
    destination: DeviceAddr,
    priority: Priority,
) -> Result<(Osi3Header, LinkKey), RoutingError> {
    let route = state
        .routes
        .get(destination)
        .ok_or(RoutingError::Unreachable(destination))?;
    let header = route
        .header
        .as_ref()
        .ok_or(RoutingError::Unreachable(destination))?;

    let flags = state
        .topology
        .link(&route.first_hop)
        .map(|l| l.flags)
        .unwrap_or(LinkFlags::empty());
    let header = if flags.contains(LinkFlags::REDUCE_TO_CONTROL_BYTE) {
        Osi3Header::control_byte_only(priority)
    } else if header.hops.is_empty() {
        // only transparent links in between and nothing to address them with
        return Err(RoutingError::Unreachable(destination));
    } else {
        header.clone().with_priority(priority)
    };
    Ok((header, route.first_hop))
}

#[async_trait]
impl FrameSink for Transmitter {
    async fn transmit(
        &self,
        destination: DeviceAddr,
        priority: Priority,
        payload: Bytes,
    ) -> Result<(), SegmentError> {
        self.send_frame(destination, priority, payload)
            .await
            .map_err(|e| SegmentError::Transmit(e.to_string()))
    }
}

/// Routing and dispatch layer of one device
#[derive(Debug)]
pub struct Osi3Router {
    shared: Arc<Shared>,
    transmitter: Transmitter,
    segmenter: Segmenter,
    ingress: IngressSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Osi3Router {
    /// Build the topology for `local`, bind link layers and start the workers.
    ///
    /// Any topology or link-layer configuration error aborts start-up, as
    /// does a frame budget too small for a block header.
    pub async fn start(
        local: DeviceAddr,
        description: &TopologyDescription,
        mut config: RouterConfig,
        registry: &ProtocolRegistry,
    ) -> Result<Self, RoutingError> {
        if config.frame_budget <= FrameFamily::Bigger.start_header_len() {
            return Err(SegmentError::FrameBudget(config.frame_budget).into());
        }
        config.segmenter.frame_budget = config.frame_budget;
        config.reassembly.frame_budget = config.frame_budget;

        let mut topology = Topology::build(local, description)?;

        let mut layers = Vec::new();
        for port in topology.ports(local) {
            let Some(protocol) = &port.protocol else {
                continue;
            };
            let layer = registry.create(
                protocol,
                LinkSettings {
                    port: port.port,
                    properties: port.properties.clone(),
                },
            )?;
            layers.push(layer);
        }
        apply_link_properties(&mut topology, &layers);

        let routes = RouteTable::compute(&topology);
        info!(
            "Router for device {}: {} devices, {} routes, {} link layers",
            local,
            topology.device_count(),
            routes.len(),
            layers.len()
        );

        let shared = Arc::new(Shared {
            local,
            config: config.clone(),
            state: RwLock::new(Arc::new(NetworkState { topology, routes })),
            links: layers.iter().map(|l| (l.port(), l.clone())).collect(),
            listeners: Listeners::default(),
            stats: StatsCounters::default(),
        });

        let transmitter = Transmitter {
            shared: shared.clone(),
        };
        let (segmenter, dispatch) =
            Segmenter::spawn(local, config.segmenter.clone(), transmitter.clone());

        let handler = InboundHandler::new(shared.clone(), Reassembler::new(config.reassembly));
        let (ingress, worker) = IngressPipeline::spawn(&config.ingress, handler);

        for (started, layer) in layers.iter().enumerate() {
            if let Err(e) = layer.start(ingress.clone()).await {
                for layer in &layers[..started] {
                    layer.stop().await;
                }
                dispatch.abort();
                worker.abort();
                return Err(e.into());
            }
        }

        Ok(Self {
            shared,
            transmitter,
            segmenter,
            ingress,
            tasks: Mutex::new(vec![dispatch, worker]),
        })
    }

    /// Local device address
    pub fn local(&self) -> DeviceAddr {
        self.shared.local
    }

    /// Send a telegram.
    ///
    /// Telegrams to the local device are looped back to the listeners. Long
    /// telegrams larger than one frame go through the segmenter, which may
    /// wait for a free block number. A long telegram that fits the frame
    /// budget is sent as one plain frame, so the receiver delivers it with
    /// `is_long` false; only loopback preserves the flag as given.
    pub async fn send(
        &self,
        destination: DeviceAddr,
        priority: Priority,
        payload: Bytes,
        is_long: bool,
    ) -> Result<(), RoutingError> {
        if destination == self.shared.local {
            debug!("Loopback telegram ({} bytes)", payload.len());
            self.shared.stats.looped_back();
            self.shared.stats.delivered();
            self.shared
                .listeners
                .telegram(destination, payload, is_long);
            return Ok(());
        }

        let budget = self.shared.config.frame_budget;
        if is_long && payload.len() > budget {
            let state = self.shared.snapshot().await;
            outbound(&state, destination, priority)?;
            let block = self.segmenter.submit(destination, payload, priority).await?;
            debug!("Long telegram to {} queued as block {}", destination, block);
            self.shared.stats.sent_long();
            return Ok(());
        }

        if payload.len() > budget {
            return Err(RoutingError::Oversized {
                len: payload.len(),
                budget,
            });
        }

        self.transmitter
            .send_frame(destination, priority, payload)
            .await?;
        self.shared.stats.sent();
        Ok(())
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn TelegramListener>) -> ListenerId {
        self.shared.listeners.add(listener)
    }

    /// Unregister a listener
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Current route to a destination
    pub async fn route(&self, destination: DeviceAddr) -> Option<Route> {
        self.shared.snapshot().await.routes.get(destination).cloned()
    }

    /// Rebuild the route table from a new description.
    ///
    /// Link layers keep running; ports added by the new description have no
    /// link layer until the router is restarted.
    pub async fn reload_topology(
        &self,
        description: &TopologyDescription,
    ) -> Result<(), RoutingError> {
        let local = self.shared.local;
        let mut topology = Topology::build(local, description)?;

        let layers: Vec<Arc<dyn LinkLayer>> = self
            .shared
            .links
            .iter()
            .map(|e| e.value().clone())
            .collect();
        apply_link_properties(&mut topology, &layers);
        for port in topology.ports(local) {
            if port.protocol.is_some() && !self.shared.links.contains_key(&port.port) {
                warn!("Port {} has no running link layer", port.port);
            }
        }

        let routes = RouteTable::compute(&topology);
        info!(
            "Reloaded topology for device {}: {} routes",
            local,
            routes.len()
        );
        *self.shared.state.write().await = Arc::new(NetworkState { topology, routes });
        Ok(())
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> RouterStats {
        let routes = self.shared.snapshot().await.routes.len();
        self.shared.stats.snapshot(self.shared.local.0, routes)
    }

    /// Long-telegram sessions in flight towards `destination`
    pub fn in_flight(&self, destination: DeviceAddr) -> usize {
        self.segmenter.in_flight(destination)
    }

    /// Link layer bound to a local port
    pub fn link_layer(&self, port: u8) -> Option<Arc<dyn LinkLayer>> {
        self.shared.link_layer(port).ok()
    }

    /// Stop link layers and background tasks
    pub async fn shutdown(&self) {
        for entry in self.shared.links.iter() {
            entry.value().stop().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(
            "Router for device {} stopped (ingress closed: {})",
            self.shared.local,
            self.ingress.is_closed()
        );
    }
}

/// Fold link-layer properties into the flags of the links on each port
fn apply_link_properties(topology: &mut Topology, layers: &[Arc<dyn LinkLayer>]) {
    let local = topology.local();
    for layer in layers {
        let mut flags = LinkFlags::empty();
        flags.set(LinkFlags::REFLECT, is_enabled(layer.as_ref(), REFLECT_PROPERTY));
        flags.set(
            LinkFlags::REDUCE_TO_CONTROL_BYTE,
            is_enabled(layer.as_ref(), REDUCE_PROPERTY),
        );
        if flags.is_empty() {
            continue;
        }

        let keys: Vec<_> = topology
            .links_on_port(local, layer.port())
            .map(|l| l.key)
            .collect();
        for key in keys {
            debug!("Link {} flags {:?}", key, flags);
            topology.insert_flags(&key, flags);
        }
    }
}

fn is_enabled(layer: &dyn LinkLayer, property: &str) -> bool {
    layer
        .property(property)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
