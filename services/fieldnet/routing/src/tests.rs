//! Router scenarios over in-process links.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fieldnet_link::{
    ConfigurationError, IngressConfig, IngressEvent, IngressHandler, IngressPipeline,
    IngressSender, LinkError, LinkLayer, LinkSettings, MemoryLink, ProtocolRegistry,
};
use fieldnet_longtel::SegmentError;
use fieldnet_topology::{DeviceAddr, LinkFlags, TopologyDescription};
use fieldnet_wire::{FragmentKind, Priority, FRAME_BUDGET};
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::{Delivery, DropReason, Osi3Router, RouterConfig, RouterStats, RoutingError};

const WAIT: Duration = Duration::from_secs(5);
const RECORDING: &str = "recording";

/// Frames sent by recording links, keyed by their `tap` property
static TAPS: Lazy<DashMap<String, Vec<Bytes>>> = Lazy::new(DashMap::new);

/// Memory link that keeps a copy of every frame it sends
#[derive(Debug)]
struct RecordingLink {
    tap: String,
    inner: Arc<dyn LinkLayer>,
}

impl RecordingLink {
    fn create(settings: LinkSettings) -> Result<Arc<dyn LinkLayer>, ConfigurationError> {
        let tap = settings.properties.get("tap").cloned().unwrap_or_default();
        let inner = MemoryLink::create(settings)?;
        Ok(Arc::new(Self { tap, inner }))
    }
}

#[async_trait]
impl LinkLayer for RecordingLink {
    fn protocol(&self) -> &str {
        RECORDING
    }

    fn port(&self) -> u8 {
        self.inner.port()
    }

    fn property(&self, name: &str) -> Option<&str> {
        self.inner.property(name)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn start(&self, ingress: IngressSender) -> Result<(), LinkError> {
        self.inner.start(ingress).await
    }

    async fn send(&self, priority: Priority, frame: Bytes) -> Result<(), LinkError> {
        TAPS.entry(self.tap.clone()).or_default().push(frame.clone());
        self.inner.send(priority, frame).await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }
}

fn tapped(tap: &str) -> Vec<Bytes> {
    TAPS.get(tap).map(|frames| frames.clone()).unwrap_or_default()
}

fn registry() -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::with_builtin();
    registry.register(RECORDING, RecordingLink::create);
    registry
}

async fn node(
    local: u8,
    description: &TopologyDescription,
) -> (Osi3Router, mpsc::UnboundedReceiver<Delivery>) {
    node_with(local, description, RouterConfig::default()).await
}

async fn node_with(
    local: u8,
    description: &TopologyDescription,
    config: RouterConfig,
) -> (Osi3Router, mpsc::UnboundedReceiver<Delivery>) {
    let router = Osi3Router::start(DeviceAddr(local), description, config, &registry())
        .await
        .unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    router.add_listener(Arc::new(tx));
    (router, rx)
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(WAIT, rx.recv())
        .await
        .expect("no delivery in time")
        .expect("listener channel closed")
}

/// Next telegram, skipping link-state notifications
async fn next_telegram(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> (DeviceAddr, Bytes, bool) {
    loop {
        if let Delivery::Telegram {
            sender,
            payload,
            is_long,
        } = next_delivery(rx).await
        {
            return (sender, payload, is_long);
        }
    }
}

async fn wait_for_stats<F>(router: &Osi3Router, check: F) -> RouterStats
where
    F: Fn(&RouterStats) -> bool,
{
    timeout(WAIT, async {
        loop {
            let stats = router.stats().await;
            if check(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("statistics did not settle")
}

struct Capture(mpsc::UnboundedSender<IngressEvent>);

#[async_trait]
impl IngressHandler for Capture {
    async fn handle(&mut self, event: IngressEvent) {
        let _ = self.0.send(event);
    }
}

/// Bare link endpoint standing in for a remote device
async fn peer(channel: &str, port: u8) -> (Arc<dyn LinkLayer>, mpsc::UnboundedReceiver<IngressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ingress, _worker) = IngressPipeline::spawn(&IngressConfig::default(), Capture(tx));
    let link = MemoryLink::create(LinkSettings {
        port,
        properties: [("channel".to_string(), channel.to_string())]
            .into_iter()
            .collect(),
    })
    .unwrap();
    link.start(ingress).await.unwrap();
    (link, rx)
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<IngressEvent>) -> Bytes {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("no frame in time")
            .expect("ingress closed");
        if let IngressEvent::Frame { frame, .. } = event {
            return frame;
        }
    }
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

#[tokio::test]
async fn test_long_telegram_over_chain() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .connect((2, 2), (3, 1), LinkFlags::empty())
        .bind((1, 1), RECORDING, &[("channel", "chain-a"), ("tap", "chain/1")])
        .bind((2, 1), "memory", &[("channel", "chain-a")])
        .bind((2, 2), RECORDING, &[("channel", "chain-b"), ("tap", "chain/2")])
        .bind((3, 1), "memory", &[("channel", "chain-b")]);

    let (first, _first_rx) = node(1, &description).await;
    let (middle, _middle_rx) = node(2, &description).await;
    let (last, mut last_rx) = node(3, &description).await;

    let payload = pattern(500);
    first
        .send(DeviceAddr(3), Priority::Normal, payload.clone(), true)
        .await
        .unwrap();

    let (sender, received, is_long) = next_telegram(&mut last_rx).await;
    assert_eq!(sender, DeviceAddr(1));
    assert_eq!(received, payload);
    assert!(is_long);

    let sent = tapped("chain/1");
    assert_eq!(sent.len(), 3);
    let kinds: Vec<FragmentKind> = sent
        .iter()
        .map(|f| FragmentKind::try_from(f[9]).unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            FragmentKind::StartBig,
            FragmentKind::NextBigPiece,
            FragmentKind::EndBigBlock
        ]
    );
    for frame in &sent {
        assert_eq!(&frame[..5], &[0x11, 1, 1, 2, 1]);
    }

    // the middle device only advances the pointer
    let forwarded = tapped("chain/2");
    assert_eq!(forwarded.len(), 3);
    for (original, passed) in sent.iter().zip(&forwarded) {
        assert_eq!(passed[0], 0x12);
        assert_eq!(&passed[1..], &original[1..]);
    }

    let stats = wait_for_stats(&middle, |s| s.frames_forwarded == 3).await;
    assert_eq!(stats.telegrams_delivered, 0);
    assert_eq!(first.stats().await.long_telegrams_sent, 1);
    let stats = last.stats().await;
    assert_eq!(stats.long_telegrams_reassembled, 1);
    assert_eq!(stats.telegrams_delivered, 1);

    first.shutdown().await;
    middle.shutdown().await;
    last.shutdown().await;
}

#[tokio::test]
async fn test_short_telegram_back_along_chain() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .connect((2, 2), (3, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "back-a")])
        .bind((2, 1), "memory", &[("channel", "back-a")])
        .bind((2, 2), "memory", &[("channel", "back-b")])
        .bind((3, 1), "memory", &[("channel", "back-b")]);

    let (first, mut first_rx) = node(1, &description).await;
    let (middle, _middle_rx) = node(2, &description).await;
    let (last, _last_rx) = node(3, &description).await;

    last.send(
        DeviceAddr(1),
        Priority::Urgent,
        Bytes::from_static(b"hello"),
        false,
    )
    .await
    .unwrap();

    let (sender, payload, is_long) = next_telegram(&mut first_rx).await;
    assert_eq!(sender, DeviceAddr(3));
    assert_eq!(payload, Bytes::from_static(b"hello"));
    assert!(!is_long);
    assert_eq!(last.stats().await.telegrams_sent, 1);

    first.shutdown().await;
    middle.shutdown().await;
    last.shutdown().await;
}

#[tokio::test]
async fn test_transparent_repeater() {
    // device 2 repeats on 1-2 without routing; 1 and 3 share one medium
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::TRANSPARENT)
        .connect((2, 2), (3, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "repeater")])
        .bind((3, 1), "memory", &[("channel", "repeater")]);

    let (near, mut near_rx) = node(1, &description).await;
    let (far, mut far_rx) = node(3, &description).await;

    let route = near.route(DeviceAddr(3)).await.unwrap();
    assert_eq!(route.hop_count, 1);

    far.send(
        DeviceAddr(1),
        Priority::Normal,
        Bytes::from_static(b"from-far"),
        false,
    )
    .await
    .unwrap();
    let (sender, payload, _) = next_telegram(&mut near_rx).await;
    assert_eq!(sender, DeviceAddr(3));
    assert_eq!(payload, Bytes::from_static(b"from-far"));

    near.send(
        DeviceAddr(3),
        Priority::Normal,
        Bytes::from_static(b"from-near"),
        false,
    )
    .await
    .unwrap();
    let (_, payload, _) = next_telegram(&mut far_rx).await;
    assert_eq!(payload, Bytes::from_static(b"from-near"));

    near.shutdown().await;
    far.shutdown().await;
}

#[tokio::test]
async fn test_loopback_and_send_errors() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .bind((1, 1), RECORDING, &[("channel", "loop"), ("tap", "loop/1")]);

    let (router, mut rx) = node(1, &description).await;

    router
        .send(
            DeviceAddr(1),
            Priority::Normal,
            Bytes::from_static(b"self"),
            false,
        )
        .await
        .unwrap();
    let (sender, payload, _) = next_telegram(&mut rx).await;
    assert_eq!(sender, DeviceAddr(1));
    assert_eq!(payload, Bytes::from_static(b"self"));
    assert!(tapped("loop/1").is_empty());

    assert_eq!(
        router
            .send(DeviceAddr(9), Priority::Normal, Bytes::from_static(b"x"), false)
            .await,
        Err(RoutingError::Unreachable(DeviceAddr(9)))
    );
    assert_eq!(
        router
            .send(DeviceAddr(9), Priority::Normal, pattern(600), true)
            .await,
        Err(RoutingError::Unreachable(DeviceAddr(9)))
    );
    assert_eq!(
        router
            .send(DeviceAddr(2), Priority::Normal, pattern(300), false)
            .await,
        Err(RoutingError::Oversized {
            len: 300,
            budget: FRAME_BUDGET
        })
    );

    let stats = router.stats().await;
    assert_eq!(stats.loopback, 1);
    assert_eq!(stats.telegrams_sent, 0);
    assert_eq!(stats.total_routes, 1);

    router.shutdown().await;
}

#[tokio::test]
async fn test_mirrored_receive_and_link_state() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::MIRRORED_RECEIVE)
        .bind((1, 1), "memory", &[("channel", "mirror")]);

    let (router, mut rx) = node(1, &description).await;
    let (remote, _remote_rx) = peer("mirror", 1).await;

    assert_eq!(
        next_delivery(&mut rx).await,
        Delivery::LinkState {
            device: DeviceAddr(2),
            connected: true
        }
    );

    // return path as written by a mirroring partner: pointer 0, one pair
    remote
        .send(
            Priority::Normal,
            Bytes::from_static(&[0x08, 1, 1, b'p', b'i', b'n', b'g']),
        )
        .await
        .unwrap();
    let (sender, payload, is_long) = next_telegram(&mut rx).await;
    assert_eq!(sender, DeviceAddr(2));
    assert_eq!(payload, Bytes::from_static(b"ping"));
    assert!(!is_long);

    remote.stop().await;
    assert_eq!(
        next_delivery(&mut rx).await,
        Delivery::LinkState {
            device: DeviceAddr(2),
            connected: false
        }
    );

    router.shutdown().await;
}

#[tokio::test]
async fn test_inbound_drops() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "drops")]);

    let (router, _rx) = node(1, &description).await;
    let (remote, _remote_rx) = peer("drops", 1).await;

    remote
        .send(Priority::Normal, Bytes::from_static(&[0x08, 1, 1, b'x']))
        .await
        .unwrap();
    // length 2 announced, no pairs present
    remote
        .send(Priority::Normal, Bytes::from_static(&[0x10]))
        .await
        .unwrap();

    let stats = wait_for_stats(&router, |s| s.frames_dropped == 2).await;
    assert_eq!(stats.dropped(DropReason::Unmirrored), 1);
    assert_eq!(stats.dropped(DropReason::Malformed), 1);
    assert_eq!(stats.telegrams_delivered, 0);

    router.shutdown().await;
    remote.stop().await;
}

#[tokio::test]
async fn test_force_mirroring() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "forced")]);

    let config = RouterConfig {
        force_mirroring: true,
        ..RouterConfig::default()
    };
    let (router, mut rx) = node_with(1, &description, config).await;
    let (remote, _remote_rx) = peer("forced", 1).await;

    remote
        .send(Priority::Normal, Bytes::from_static(&[0x08, 1, 1, b'o', b'k']))
        .await
        .unwrap();
    let (sender, payload, _) = next_telegram(&mut rx).await;
    assert_eq!(sender, DeviceAddr(2));
    assert_eq!(payload, Bytes::from_static(b"ok"));

    router.shutdown().await;
    remote.stop().await;
}

#[tokio::test]
async fn test_reduce_to_control_byte() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::TRANSPARENT)
        .bind(
            (1, 1),
            "memory",
            &[("channel", "reduce"), ("reduce_to_control_byte", "TRUE")],
        );

    let (router, _rx) = node(1, &description).await;
    let (_remote, mut remote_rx) = peer("reduce", 1).await;

    router
        .send(DeviceAddr(2), Priority::Urgent, Bytes::from_static(b"hi"), false)
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut remote_rx).await,
        Bytes::from_static(&[0x80, b'h', b'i'])
    );
    router.shutdown().await;

    // same route without the property has nothing to address the hop with
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::TRANSPARENT)
        .bind((1, 1), "memory", &[("channel", "reduce-off")]);
    let (router, _rx) = node(1, &description).await;
    assert_eq!(
        router
            .send(DeviceAddr(2), Priority::Normal, Bytes::from_static(b"hi"), false)
            .await,
        Err(RoutingError::Unreachable(DeviceAddr(2)))
    );
    router.shutdown().await;
}

#[tokio::test]
async fn test_reload_topology() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "reload")]);

    let (router, _rx) = node(1, &description).await;
    assert!(router.route(DeviceAddr(3)).await.is_none());

    description.connect((2, 2), (3, 1), LinkFlags::empty());
    router.reload_topology(&description).await.unwrap();
    let route = router.route(DeviceAddr(3)).await.unwrap();
    assert_eq!(route.hop_count, 2);
    assert_eq!(router.stats().await.total_routes, 2);

    let mut broken = description.clone();
    broken.connect((1, 0), (4, 1), LinkFlags::empty());
    assert!(matches!(
        router.reload_topology(&broken).await,
        Err(RoutingError::Topology(_))
    ));
    assert!(router.route(DeviceAddr(3)).await.is_some());

    router.shutdown().await;
}

#[tokio::test]
async fn test_start_rejects_unknown_protocol() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .bind((1, 1), "serial", &[]);

    let result = Osi3Router::start(
        DeviceAddr(1),
        &description,
        RouterConfig::default(),
        &registry(),
    )
    .await;
    assert!(matches!(
        result,
        Err(RoutingError::Configuration(
            ConfigurationError::UnknownProtocol(_)
        ))
    ));
}

#[tokio::test]
async fn test_router_budget_sizes_long_telegram_pieces() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "budget")]);

    // the segmenter section keeps its default budget; the router's wins
    let config = RouterConfig {
        frame_budget: 100,
        ..RouterConfig::default()
    };
    let (router, _rx) = node_with(1, &description, config).await;
    let (_remote, mut remote_rx) = peer("budget", 1).await;

    router
        .send(DeviceAddr(2), Priority::Normal, pattern(200), true)
        .await
        .unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let frame = next_frame(&mut remote_rx).await;
        assert_eq!(&frame[..3], &[0x09, 1, 1]);
        assert!(frame.len() - 3 <= 100);
        kinds.push(FragmentKind::try_from(frame[7]).unwrap());
    }
    assert_eq!(
        kinds,
        vec![
            FragmentKind::StartBig,
            FragmentKind::NextBigPiece,
            FragmentKind::EndBigBlock
        ]
    );
    router.shutdown().await;

    let result = Osi3Router::start(
        DeviceAddr(1),
        &description,
        RouterConfig {
            frame_budget: 8,
            ..RouterConfig::default()
        },
        &registry(),
    )
    .await;
    assert!(matches!(
        result,
        Err(RoutingError::Segment(SegmentError::FrameBudget(8)))
    ));
}

#[tokio::test]
async fn test_suppressed_pointer_increment() {
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .connect((2, 2), (3, 1), LinkFlags::SUPPRESS_POINTER_INCREMENT)
        .bind((2, 1), "memory", &[("channel", "suppress-a")])
        .bind((2, 2), "memory", &[("channel", "suppress-b")]);

    let (router, _rx) = node(2, &description).await;
    let (upstream, _upstream_rx) = peer("suppress-a", 1).await;
    let (_downstream, mut downstream_rx) = peer("suppress-b", 1).await;

    upstream
        .send(
            Priority::Normal,
            Bytes::from_static(&[0x11, 1, 1, 2, 1, b'a', b'b']),
        )
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut downstream_rx).await,
        Bytes::from_static(&[0x11, 1, 1, 2, 1, b'a', b'b'])
    );
    wait_for_stats(&router, |s| s.frames_forwarded == 1).await;

    router.shutdown().await;
    upstream.stop().await;
}

#[tokio::test]
async fn test_reflect_property_reverses_return_path() {
    // 3 -> 2 -> 1; device 2 hands over the return path as written by 3
    let mut description = TopologyDescription::new();
    description
        .connect((3, 1), (2, 2), LinkFlags::empty())
        .connect((2, 1), (1, 1), LinkFlags::empty())
        .bind((1, 1), "memory", &[("channel", "reflect"), ("reflect", "true")]);

    let (router, mut rx) = node(1, &description).await;
    let (remote, _remote_rx) = peer("reflect", 1).await;

    remote
        .send(
            Priority::Normal,
            Bytes::from_static(&[0x10, 1, 1, 2, 1, b'r', b'e', b't']),
        )
        .await
        .unwrap();
    let (sender, payload, _) = next_telegram(&mut rx).await;
    assert_eq!(sender, DeviceAddr(3));
    assert_eq!(payload, Bytes::from_static(b"ret"));

    router.shutdown().await;
    remote.stop().await;
}

#[tokio::test]
async fn test_transit_into_transparent_segment() {
    // the pair after device 2 starts behind the transparent device 3
    let mut description = TopologyDescription::new();
    description
        .connect((1, 1), (2, 1), LinkFlags::empty())
        .connect((2, 2), (3, 3), LinkFlags::TRANSPARENT)
        .connect((3, 4), (4, 1), LinkFlags::empty())
        .bind((2, 1), "memory", &[("channel", "segment-a")])
        .bind((2, 2), "memory", &[("channel", "segment-b")]);

    let (router, _rx) = node(2, &description).await;
    let (upstream, _upstream_rx) = peer("segment-a", 1).await;
    let (_downstream, mut downstream_rx) = peer("segment-b", 3).await;

    upstream
        .send(
            Priority::Normal,
            Bytes::from_static(&[0x11, 1, 1, 4, 1, b'f', b'w', b'd']),
        )
        .await
        .unwrap();
    assert_eq!(
        next_frame(&mut downstream_rx).await,
        Bytes::from_static(&[0x12, 1, 1, 4, 1, b'f', b'w', b'd'])
    );

    router.shutdown().await;
    upstream.stop().await;
}
