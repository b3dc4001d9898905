//! Configuration handling for the fieldnet node.
//!
//! A single YAML file lists the devices run by this process, the router,
//! segmenter, reassembly and ingress settings, and the network topology.
//! Missing sections fall back to defaults; a missing or unparsable file is
//! fatal. A few values can be overridden from the environment.

use anyhow::{Context, Result};
use fieldnet_link::IngressConfig;
use fieldnet_longtel::{ReassemblyConfig, SegmenterConfig};
use fieldnet_routing::RouterConfig;
use fieldnet_topology::{DeviceAddr, TopologyDescription};
use fieldnet_wire::FRAME_BUDGET;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Comma-separated device addresses replacing `nodes`
pub const NODES_ENV: &str = "FIELDNET_NODES";

/// Ingress queue capacity replacing `ingress.capacity`
pub const INGRESS_CAPACITY_ENV: &str = "FIELDNET_INGRESS_CAPACITY";

/// Node configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldnetConfig {
    /// Devices run in this process
    pub nodes: Vec<DeviceAddr>,
    /// Routing layer settings
    pub router: RouterSection,
    /// Long-telegram segmenter settings
    pub segmenter: SegmenterConfig,
    /// Reassembly settings
    pub reassembly: ReassemblySection,
    /// Ingress pipeline settings
    pub ingress: IngressConfig,
    /// Network description shared by all nodes
    pub topology: TopologyDescription,
}

/// `router` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Treat every received frame as addressed to the local device
    pub force_mirroring: bool,
    /// Largest OSI-7 payload carried by one frame
    pub frame_budget: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            force_mirroring: false,
            frame_budget: FRAME_BUDGET,
        }
    }
}

/// `reassembly` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySection {
    /// Stale-session timeout such as `30s`; unset keeps sessions forever
    pub session_timeout: Option<String>,
}

impl FieldnetConfig {
    /// Load configuration from file, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let mut config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);

        config.apply_overrides(|name| std::env::var(name).ok())?;
        // surface a bad timeout before any router starts
        config.router_config()?;

        info!(
            "Final configuration: nodes={:?}, devices={}, frame_budget={}, ingress_capacity={}",
            config.nodes,
            config.topology.devices.len(),
            config.router.frame_budget,
            config.ingress.capacity
        );
        Ok(config)
    }

    /// Apply overrides looked up by variable name
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(nodes) = lookup(NODES_ENV) {
            self.nodes = parse_nodes(&nodes)
                .with_context(|| format!("Invalid {} value {:?}", NODES_ENV, nodes))?;
            info!("Nodes overridden by environment: {:?}", self.nodes);
        }

        if let Some(capacity) = lookup(INGRESS_CAPACITY_ENV) {
            match capacity.parse::<usize>() {
                Ok(capacity) if capacity > 0 => {
                    self.ingress.capacity = capacity;
                    info!("Ingress capacity overridden by environment: {}", capacity);
                }
                _ => warn!(
                    "Ignoring invalid {} value {:?}",
                    INGRESS_CAPACITY_ENV, capacity
                ),
            }
        }

        Ok(())
    }

    /// Router settings assembled from the individual sections
    pub fn router_config(&self) -> Result<RouterConfig> {
        let frame_budget = self.router.frame_budget;
        Ok(RouterConfig {
            force_mirroring: self.router.force_mirroring,
            frame_budget,
            segmenter: SegmenterConfig {
                frame_budget,
                ..self.segmenter.clone()
            },
            reassembly: ReassemblyConfig {
                session_timeout: self.session_timeout()?,
                frame_budget,
            },
            ingress: self.ingress.clone(),
        })
    }

    fn session_timeout(&self) -> Result<Option<Duration>> {
        self.reassembly
            .session_timeout
            .as_deref()
            .map(|value| {
                humantime::parse_duration(value)
                    .with_context(|| format!("Invalid reassembly.session_timeout {:?}", value))
            })
            .transpose()
    }
}

/// Parse `1,2, 3` into device addresses
pub fn parse_nodes(value: &str) -> Result<Vec<DeviceAddr>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u8>()
                .map(DeviceAddr)
                .with_context(|| format!("Invalid device address {:?}", s))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldnet_longtel::ChecksumMode;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const YAML: &str = r#"
nodes: [1, 3]

router:
  force_mirroring: false

segmenter:
  window: 4
  checksum: disabled

reassembly:
  session_timeout: 30s

ingress:
  capacity: 500

topology:
  devices:
    - address: 1
      ports:
        - port: 1
          protocol: memory
          properties: { channel: "1-2" }
          partners:
            - { device: 2, port: 1 }
    - address: 2
      ports:
        - port: 1
          partners:
            - { device: 1, port: 1 }
        - port: 2
          partners:
            - { device: 3, port: 1, suppress_pointer_increment: true }
    - address: 3
      ports:
        - port: 1
          protocol: memory
          properties: { channel: "2-3" }
          partners:
            - { device: 2, port: 2 }
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file
    }

    #[test]
    fn test_default_config() {
        let config = FieldnetConfig::default();
        assert!(config.nodes.is_empty());
        assert_eq!(config.router.frame_budget, FRAME_BUDGET);
        assert_eq!(config.ingress.capacity, 2000);
        assert!(!config.ingress.prioritize);

        let router = config.router_config().unwrap();
        assert_eq!(router.reassembly.session_timeout, None);
        assert_eq!(router.segmenter.checksum, ChecksumMode::Disabled);
    }

    #[test]
    fn test_load_from_file() {
        let temp_file = write_config(YAML);
        let mut config: FieldnetConfig = serde_yaml::from_str(YAML).unwrap();
        config.apply_overrides(|_| None).unwrap();

        assert_eq!(config.nodes, vec![DeviceAddr(1), DeviceAddr(3)]);
        assert_eq!(config.segmenter.window, 4);
        assert_eq!(config.segmenter.frame_budget, FRAME_BUDGET);
        assert_eq!(config.ingress.capacity, 500);
        assert_eq!(config.topology.devices.len(), 3);
        assert!(config.topology.devices[1].ports[1].partners[0].suppress_pointer_increment);

        let router = config.router_config().unwrap();
        assert_eq!(
            router.reassembly.session_timeout,
            Some(Duration::from_secs(30))
        );

        // the file path goes through the same parser
        let loaded = FieldnetConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.topology, config.topology);
    }

    #[test]
    fn test_router_budget_drives_segmenter_and_reassembly() {
        let yaml = "router:\n  frame_budget: 100\nsegmenter:\n  frame_budget: 50\n  window: 2\n";
        let config: FieldnetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.segmenter.window, 2);

        let router = config.router_config().unwrap();
        assert_eq!(router.frame_budget, 100);
        assert_eq!(router.segmenter.frame_budget, 100);
        assert_eq!(router.reassembly.frame_budget, 100);
    }

    #[test]
    fn test_missing_or_broken_file_is_fatal() {
        assert!(FieldnetConfig::load_from_file("/nonexistent/fieldnet.yaml").is_err());

        let temp_file = write_config("nodes: [1, 2\n");
        assert!(FieldnetConfig::load_from_file(temp_file.path()).is_err());

        let temp_file = write_config("reassembly:\n  session_timeout: soon\n");
        assert!(FieldnetConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [(NODES_ENV, "2, 5"), (INGRESS_CAPACITY_ENV, "64")]
            .into_iter()
            .collect();
        let mut config = FieldnetConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.nodes, vec![DeviceAddr(2), DeviceAddr(5)]);
        assert_eq!(config.ingress.capacity, 64);

        let mut config = FieldnetConfig::default();
        config
            .apply_overrides(|name| (name == INGRESS_CAPACITY_ENV).then(|| "zero".to_string()))
            .unwrap();
        assert_eq!(config.ingress.capacity, 2000);

        let mut config = FieldnetConfig::default();
        assert!(config
            .apply_overrides(|name| (name == NODES_ENV).then(|| "1,300".to_string()))
            .is_err());
    }

    #[test]
    fn test_parse_nodes() {
        assert_eq!(
            parse_nodes("1,2,3").unwrap(),
            vec![DeviceAddr(1), DeviceAddr(2), DeviceAddr(3)]
        );
        assert!(parse_nodes("").unwrap().is_empty());
        assert!(parse_nodes("a").is_err());
    }
}
