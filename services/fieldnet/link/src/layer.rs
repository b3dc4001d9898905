//! Link-layer abstraction and protocol registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fieldnet_wire::Priority;
use tracing::debug;

use crate::{memory, ConfigurationError, IngressSender, LinkError};

/// One link-layer instance, bound to a single local port
#[async_trait]
pub trait LinkLayer: Send + Sync + Debug {
    /// Protocol identifier this instance was created for
    fn protocol(&self) -> &str;

    /// Local port the instance serves
    fn port(&self) -> u8;

    /// Configured property value
    fn property(&self, name: &str) -> Option<&str>;

    /// Whether a peer is attached
    fn is_connected(&self) -> bool;

    /// Attach to the medium; received frames and state changes go to `ingress`
    async fn start(&self, ingress: IngressSender) -> Result<(), LinkError>;

    /// Transmit one complete frame
    async fn send(&self, priority: Priority, frame: Bytes) -> Result<(), LinkError>;

    /// Detach from the medium
    async fn stop(&self);
}

/// Construction parameters handed to a link factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSettings {
    /// Local port
    pub port: u8,
    /// Port properties from the topology description
    pub properties: BTreeMap<String, String>,
}

/// Factory creating a link layer for one port
pub type LinkFactory = fn(LinkSettings) -> Result<Arc<dyn LinkLayer>, ConfigurationError>;

/// Mapping of protocol identifiers to link factories
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    factories: HashMap<String, LinkFactory>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in protocols
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(memory::PROTOCOL, memory::MemoryLink::create);
        registry
    }

    /// Register or replace a protocol factory
    pub fn register(&mut self, protocol: &str, factory: LinkFactory) {
        debug!("Registering link protocol '{}'", protocol);
        self.factories.insert(protocol.to_string(), factory);
    }

    /// Whether a protocol is known
    pub fn contains(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }

    /// Registered protocol identifiers
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Create a link layer for `protocol`
    pub fn create(
        &self,
        protocol: &str,
        settings: LinkSettings,
    ) -> Result<Arc<dyn LinkLayer>, ConfigurationError> {
        let factory = self
            .factories
            .get(protocol)
            .ok_or_else(|| ConfigurationError::UnknownProtocol(protocol.to_string()))?;
        factory(settings)
    }
}
