//! Topology description types.
//!
//! A [`TopologyDescription`] is the serde view of the network: devices, their
//! ports, and for every port the partner ports it is wired to. Each partner
//! entry becomes one directed link once the description is built into a
//! [`Topology`](crate::Topology).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Device address on the field network (0..=255)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddr(pub u8);

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for DeviceAddr {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Lookup key of a directed link: origin device, local port, remote port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    /// Device the link leaves from
    pub device: DeviceAddr,
    /// Port on the origin device
    pub port: u8,
    /// Port on the partner device
    pub remote_port: u8,
}

impl LinkKey {
    /// Create a new link key
    pub fn new(device: DeviceAddr, port: u8, remote_port: u8) -> Self {
        Self {
            device,
            port,
            remote_port,
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.device, self.port, self.remote_port)
    }
}

bitflags! {
    /// Per-link behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LinkFlags: u8 {
        /// Excluded from OSI-3 hop accounting (plain repeater)
        const TRANSPARENT = 0x01;
        /// Peer mirrors the routing field back to us
        const MIRRORED_RECEIVE = 0x02;
        /// Peer does not expect the pointer to be incremented
        const SUPPRESS_POINTER_INCREMENT = 0x04;
        /// Reflect pointer-0 headers received on this link
        const REFLECT = 0x08;
        /// Collapse outgoing headers to the control byte
        const REDUCE_TO_CONTROL_BYTE = 0x10;
    }
}

/// Whole-network description, as loaded from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescription {
    /// All devices of the network
    #[serde(default)]
    pub devices: Vec<DeviceDescription>,
}

/// One device and its ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// Device address
    pub address: DeviceAddr,
    /// Ports on this device
    #[serde(default)]
    pub ports: Vec<PortDescription>,
}

/// One port, its link-layer binding and its partners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    /// Port address (1..=254)
    pub port: u8,
    /// Link-layer protocol identifier, required on locally terminated ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Free-form link-layer properties
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    /// Remote ends wired to this port
    #[serde(default)]
    pub partners: Vec<PartnerDescription>,
}

/// Remote end of a directed link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerDescription {
    /// Partner device
    pub device: DeviceAddr,
    /// Partner port
    pub port: u8,
    /// Link is a plain repeater hop
    #[serde(default)]
    pub transparent: bool,
    /// Partner mirrors the routing field
    #[serde(default)]
    pub mirrored_receive: bool,
    /// Partner does not expect pointer increments
    #[serde(default)]
    pub suppress_pointer_increment: bool,
}

impl PartnerDescription {
    /// Flags declared on this partner entry
    pub fn flags(&self) -> LinkFlags {
        let mut flags = LinkFlags::empty();
        flags.set(LinkFlags::TRANSPARENT, self.transparent);
        flags.set(LinkFlags::MIRRORED_RECEIVE, self.mirrored_receive);
        flags.set(
            LinkFlags::SUPPRESS_POINTER_INCREMENT,
            self.suppress_pointer_increment,
        );
        flags
    }
}

impl TopologyDescription {
    /// Create an empty description
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a device if it is not declared yet
    pub fn device(&mut self, address: u8) -> &mut DeviceDescription {
        let address = DeviceAddr(address);
        let index = match self.devices.iter().position(|d| d.address == address) {
            Some(index) => index,
            None => {
                self.devices.push(DeviceDescription {
                    address,
                    ports: Vec::new(),
                });
                self.devices.len() - 1
            }
        };
        &mut self.devices[index]
    }

    /// Wire `a` and `b` together with two directed links carrying `flags`.
    ///
    /// Endpoints are `(device, port)` tuples.
    pub fn connect(&mut self, a: (u8, u8), b: (u8, u8), flags: LinkFlags) -> &mut Self {
        self.device(a.0).port(a.1).partners.push(partner(b, flags));
        self.device(b.0).port(b.1).partners.push(partner(a, flags));
        self
    }

    /// Bind a port to a link-layer protocol
    pub fn bind(
        &mut self,
        endpoint: (u8, u8),
        protocol: &str,
        properties: &[(&str, &str)],
    ) -> &mut Self {
        let port = self.device(endpoint.0).port(endpoint.1);
        port.protocol = Some(protocol.to_string());
        port.properties.extend(
            properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        self
    }
}

impl DeviceDescription {
    /// Declare a port on this device if it is not declared yet
    pub fn port(&mut self, port: u8) -> &mut PortDescription {
        let index = match self.ports.iter().position(|p| p.port == port) {
            Some(index) => index,
            None => {
                self.ports.push(PortDescription {
                    port,
                    protocol: None,
                    properties: BTreeMap::new(),
                    partners: Vec::new(),
                });
                self.ports.len() - 1
            }
        };
        &mut self.ports[index]
    }
}

fn partner(endpoint: (u8, u8), flags: LinkFlags) -> PartnerDescription {
    PartnerDescription {
        device: DeviceAddr(endpoint.0),
        port: endpoint.1,
        transparent: flags.contains(LinkFlags::TRANSPARENT),
        mirrored_receive: flags.contains(LinkFlags::MIRRORED_RECEIVE),
        suppress_pointer_increment: flags.contains(LinkFlags::SUPPRESS_POINTER_INCREMENT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_description() {
        let yaml = r#"
devices:
  - address: 1
    ports:
      - port: 1
        protocol: memory
        properties: { channel: "1-2" }
        partners:
          - { device: 2, port: 1, transparent: true }
  - address: 2
    ports:
      - port: 1
        partners:
          - { device: 1, port: 1, mirrored_receive: true }
"#;
        let description: TopologyDescription = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(description.devices.len(), 2);

        let port = &description.devices[0].ports[0];
        assert_eq!(port.protocol.as_deref(), Some("memory"));
        assert_eq!(port.properties.get("channel").map(String::as_str), Some("1-2"));
        assert_eq!(port.partners[0].flags(), LinkFlags::TRANSPARENT);
        assert_eq!(
            description.devices[1].ports[0].partners[0].flags(),
            LinkFlags::MIRRORED_RECEIVE
        );
    }

    #[test]
    fn test_connect_builds_both_directions() {
        let mut description = TopologyDescription::new();
        description
            .connect((1, 1), (2, 1), LinkFlags::empty())
            .connect((2, 2), (3, 1), LinkFlags::TRANSPARENT)
            .bind((1, 1), "memory", &[("channel", "a")]);

        assert_eq!(description.devices.len(), 3);
        let two = description.device(2);
        assert_eq!(two.ports.len(), 2);
        assert_eq!(two.ports[1].partners[0].device, DeviceAddr(3));
        assert!(two.ports[1].partners[0].transparent);
    }
}
