//! Arena graph of devices and directed links.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use fieldnet_wire::HopPair;
use tracing::debug;

use crate::{DeviceAddr, LinkFlags, LinkKey, TopologyDescription, TopologyError};

const MIN_PORT: u8 = 1;
const MAX_PORT: u8 = 254;

/// Directed link between two device ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Origin device and port pair
    pub key: LinkKey,
    /// Device at the far end
    pub remote: DeviceAddr,
    /// Behaviour flags
    pub flags: LinkFlags,
}

impl Link {
    /// Whether the link is excluded from hop accounting
    pub fn is_transparent(&self) -> bool {
        self.flags.contains(LinkFlags::TRANSPARENT)
    }

    /// Hop pair this link contributes to a header
    pub fn hop(&self) -> HopPair {
        HopPair::new(self.key.port, self.key.remote_port)
    }

    /// Whether `hop` addresses this link
    pub fn matches(&self, hop: HopPair) -> bool {
        self.key.port == hop.local_port && self.key.remote_port == hop.remote_port
    }
}

/// Port of a device with its link-layer binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    /// Port address
    pub port: u8,
    /// Link-layer protocol identifier
    pub protocol: Option<String>,
    /// Link-layer properties
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct DeviceNode {
    address: DeviceAddr,
    ports: Vec<Port>,
    links: Vec<usize>,
}

/// Result of resolving a hop pair from some origin device
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    /// Link leaving the origin device (transparent when the match is remote)
    pub first: &'a Link,
    /// Link matching the hop pair
    pub link: &'a Link,
}

/// Validated network graph anchored at the local device
#[derive(Debug, Clone)]
pub struct Topology {
    local: DeviceAddr,
    devices: Vec<DeviceNode>,
    index: HashMap<DeviceAddr, usize>,
    links: Vec<Link>,
    by_key: HashMap<LinkKey, usize>,
}

impl Topology {
    /// Build and validate a topology for `local`
    pub fn build(
        local: DeviceAddr,
        description: &TopologyDescription,
    ) -> Result<Self, TopologyError> {
        let mut devices = Vec::with_capacity(description.devices.len());
        let mut index = HashMap::new();

        for device in &description.devices {
            if index.insert(device.address, devices.len()).is_some() {
                return Err(TopologyError::DuplicateDevice(device.address));
            }
            let mut seen = HashSet::new();
            let mut ports = Vec::with_capacity(device.ports.len());
            for port in &device.ports {
                check_port(device.address, port.port)?;
                if !seen.insert(port.port) {
                    return Err(TopologyError::DuplicatePort {
                        device: device.address,
                        port: port.port,
                    });
                }
                ports.push(Port {
                    port: port.port,
                    protocol: port.protocol.clone(),
                    properties: port.properties.clone(),
                });
            }
            devices.push(DeviceNode {
                address: device.address,
                ports,
                links: Vec::new(),
            });
        }

        if !index.contains_key(&local) {
            return Err(TopologyError::MissingLocalDevice(local));
        }

        let mut links = Vec::new();
        let mut by_key = HashMap::new();

        for device in &description.devices {
            for port in &device.ports {
                if device.address == local && !port.partners.is_empty() && port.protocol.is_none()
                {
                    return Err(TopologyError::MissingProtocol(port.port));
                }
                for partner in &port.partners {
                    if !index.contains_key(&partner.device) {
                        return Err(TopologyError::UnknownDevice(partner.device));
                    }
                    check_port(partner.device, partner.port)?;

                    let key = LinkKey::new(device.address, port.port, partner.port);
                    if by_key.insert(key, links.len()).is_some() {
                        return Err(TopologyError::DuplicateLink {
                            device: device.address,
                            port: port.port,
                            remote_port: partner.port,
                        });
                    }
                    devices[index[&device.address]].links.push(links.len());
                    links.push(Link {
                        key,
                        remote: partner.device,
                        flags: partner.flags(),
                    });
                }
            }
        }

        debug!(
            "Built topology for device {}: {} devices, {} links",
            local,
            devices.len(),
            links.len()
        );

        Ok(Self {
            local,
            devices,
            index,
            links,
            by_key,
        })
    }

    /// The local device
    pub fn local(&self) -> DeviceAddr {
        self.local
    }

    /// Number of devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of directed links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Whether a device is declared
    pub fn contains(&self, device: DeviceAddr) -> bool {
        self.index.contains_key(&device)
    }

    /// All declared device addresses
    pub fn devices(&self) -> impl Iterator<Item = DeviceAddr> + '_ {
        self.devices.iter().map(|d| d.address)
    }

    /// Ports of a device
    pub fn ports(&self, device: DeviceAddr) -> &[Port] {
        self.index
            .get(&device)
            .map(|&i| self.devices[i].ports.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a link by key
    pub fn link(&self, key: &LinkKey) -> Option<&Link> {
        self.by_key.get(key).map(|&i| &self.links[i])
    }

    /// Links leaving a device, in declaration order
    pub fn links_from(&self, device: DeviceAddr) -> impl Iterator<Item = &Link> + '_ {
        self.index
            .get(&device)
            .into_iter()
            .flat_map(move |&i| self.devices[i].links.iter().map(move |&l| &self.links[l]))
    }

    /// Links leaving a given port of a device
    pub fn links_on_port(&self, device: DeviceAddr, port: u8) -> impl Iterator<Item = &Link> + '_ {
        self.links_from(device).filter(move |l| l.key.port == port)
    }

    /// Add behaviour flags to an existing link
    pub fn insert_flags(&mut self, key: &LinkKey, flags: LinkFlags) -> bool {
        match self.by_key.get(key) {
            Some(&i) => {
                self.links[i].flags.insert(flags);
                true
            }
            None => false,
        }
    }

    /// Resolve a hop pair seen at `origin` to a link.
    ///
    /// Links of `origin` itself are tried first; otherwise the search moves
    /// breadth-first through transparent links, never entering a device in
    /// `visited`. Devices expanded during the search are added to `visited`.
    pub fn resolve_pair(
        &self,
        origin: DeviceAddr,
        hop: HopPair,
        visited: &mut HashSet<DeviceAddr>,
    ) -> Option<Resolution<'_>> {
        visited.insert(origin);

        if let Some(link) = self.links_from(origin).find(|l| l.matches(hop)) {
            return Some(Resolution { first: link, link });
        }

        let mut queue: VecDeque<(&Link, &Link)> = VecDeque::new();
        for link in self.links_from(origin).filter(|l| l.is_transparent()) {
            queue.push_back((link, link));
        }

        while let Some((first, via)) = queue.pop_front() {
            if !visited.insert(via.remote) {
                continue;
            }
            for link in self.links_from(via.remote) {
                if link.matches(hop) {
                    return Some(Resolution { first, link });
                }
            }
            for link in self.links_from(via.remote).filter(|l| l.is_transparent()) {
                if !visited.contains(&link.remote) {
                    queue.push_back((first, link));
                }
            }
        }

        None
    }

    /// Reconstruct the sender of a frame that terminated here.
    ///
    /// `hops` are the header's pairs in forward order. The walk starts at the
    /// local device and resolves each pair backwards. With no pairs at all the
    /// sender is the device at the far end of `inbound`.
    pub fn trace_sender(&self, hops: &[HopPair], inbound: &LinkKey) -> Option<DeviceAddr> {
        if hops.is_empty() {
            return self.link(inbound).map(|l| l.remote);
        }

        let mut visited = HashSet::new();
        let mut current = self.local;
        for hop in hops.iter().rev() {
            let resolution = self.resolve_pair(current, hop.swapped(), &mut visited)?;
            current = resolution.link.remote;
        }
        Some(current)
    }
}

fn check_port(device: DeviceAddr, port: u8) -> Result<(), TopologyError> {
    if (MIN_PORT..=MAX_PORT).contains(&port) {
        Ok(())
    } else {
        Err(TopologyError::InvalidPort { device, port })
    }
}
