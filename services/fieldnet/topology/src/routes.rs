//! Breadth-first route computation.
//!
//! Routes are computed once per topology load and never mutated. Every
//! reachable device gets the first link to leave on and the OSI-3 header the
//! local device writes in front of its frames. Transparent links do not add a
//! hop pair, so a repeater chain costs nothing in the header.

use std::collections::{HashMap, HashSet, VecDeque};

use fieldnet_wire::{HopPair, Osi3Header, MAX_HOPS};
use tracing::{debug, warn};

use crate::{DeviceAddr, LinkKey, Topology};

/// Precomputed route to one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination device
    pub destination: DeviceAddr,
    /// Link the frame leaves the local device on
    pub first_hop: LinkKey,
    /// Number of addressed hops (transparent links excluded)
    pub hop_count: usize,
    /// Sender-side header, `None` when the route needs more than seven hops
    pub header: Option<Osi3Header>,
}

impl Route {
    /// Whether the header fits the control byte's hop field
    pub fn is_addressable(&self) -> bool {
        self.header.is_some()
    }
}

/// Immutable destination to route mapping
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    local: Option<DeviceAddr>,
    routes: HashMap<DeviceAddr, Route>,
}

impl RouteTable {
    /// Compute routes from the topology's local device.
    ///
    /// Transparent links cost no hop, so the search is a 0-1 breadth-first
    /// walk: transparent expansions go to the front of the queue. A device
    /// is settled the first time it is dequeued, which also ends loops made
    /// of transparent links.
    pub fn compute(topology: &Topology) -> Self {
        let local = topology.local();
        let mut routes = HashMap::new();
        let mut best: HashMap<DeviceAddr, usize> = HashMap::from([(local, 0)]);
        let mut settled = HashSet::new();
        let mut queue: VecDeque<(DeviceAddr, Option<LinkKey>, Vec<HopPair>)> =
            VecDeque::from([(local, None, Vec::new())]);

        while let Some((device, first_hop, hops)) = queue.pop_front() {
            if !settled.insert(device) {
                continue;
            }

            for link in topology.links_from(device) {
                if settled.contains(&link.remote) {
                    continue;
                }
                let mut next = hops.clone();
                if !link.is_transparent() {
                    next.push(link.hop());
                }
                if best.get(&link.remote).is_some_and(|&known| known <= next.len()) {
                    continue;
                }
                best.insert(link.remote, next.len());
                let entry = (link.remote, Some(first_hop.unwrap_or(link.key)), next);
                if link.is_transparent() {
                    queue.push_front(entry);
                } else {
                    queue.push_back(entry);
                }
            }

            let Some(first_hop) = first_hop else {
                continue;
            };
            let header = if hops.len() <= MAX_HOPS {
                Osi3Header::new(hops.iter().copied()).ok()
            } else {
                warn!(
                    "Route {} -> {} needs {} hops, more than {}",
                    local,
                    device,
                    hops.len(),
                    MAX_HOPS
                );
                None
            };
            debug!(
                "Route {} -> {} via {} ({} hops)",
                local,
                device,
                first_hop,
                hops.len()
            );
            routes.insert(
                device,
                Route {
                    destination: device,
                    first_hop,
                    hop_count: hops.len(),
                    header,
                },
            );
        }

        Self {
            local: Some(local),
            routes,
        }
    }

    /// Device the table was computed for
    pub fn local(&self) -> Option<DeviceAddr> {
        self.local
    }

    /// Route to a destination
    pub fn get(&self, destination: DeviceAddr) -> Option<&Route> {
        self.routes.get(&destination)
    }

    /// Number of reachable destinations
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no destination is reachable
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All routes, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }
}
