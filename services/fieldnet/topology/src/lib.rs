//! Network topology and route computation for fieldnet.
//!
//! The topology is loaded once from a [`TopologyDescription`], validated into
//! an arena-backed [`Topology`], and turned into an immutable [`RouteTable`]
//! by a breadth-first search from the local device.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod graph;
pub mod model;
pub mod routes;

// Re-export main types
pub use error::TopologyError;
pub use graph::{Link, Port, Resolution, Topology};
pub use model::{
    DeviceAddr, DeviceDescription, LinkFlags, LinkKey, PartnerDescription, PortDescription,
    TopologyDescription,
};
pub use routes::{Route, RouteTable};
