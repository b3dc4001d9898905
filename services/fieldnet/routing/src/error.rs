//! Routing layer errors.

use fieldnet_link::{ConfigurationError, LinkError};
use fieldnet_longtel::{ReassemblyError, SegmentError};
use fieldnet_topology::{DeviceAddr, LinkKey, TopologyError};
use fieldnet_wire::{HopPair, WireError};
use thiserror::Error;

use crate::DropReason;

/// Errors surfaced by the routing layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No route, or the route needs more hops than a header holds
    #[error("device {0} is unreachable")]
    Unreachable(DeviceAddr),

    /// Header length or pointer fields are inconsistent
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    /// Pointer-0 frame on a link that neither mirrors nor reflects
    #[error("unreflected mirrored header on link {0}")]
    Unmirrored(LinkKey),

    /// Non-long payload larger than one frame
    #[error("payload of {len} bytes exceeds the frame budget of {budget}")]
    Oversized {
        /// Payload length
        len: usize,
        /// Frame budget
        budget: usize,
    },

    /// A transit hop does not resolve to a local link
    #[error("hop {}->{} does not resolve to a link", .0.local_port, .0.remote_port)]
    UnresolvedHop(HopPair),

    /// The hop pairs of a delivered frame do not lead back to a device
    #[error("sender of frame on link {0} cannot be traced")]
    UnknownSender(LinkKey),

    /// Frame arrived on a port without a matching link
    #[error("no link on local port {0} matches the frame")]
    UnknownLink(u8),

    /// No link layer runs on the outgoing port
    #[error("no link layer bound to port {0}")]
    NoLinkLayer(u8),

    /// Reassembly discarded the session
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    /// Segmenter refused the telegram
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// Link layer failed to transmit
    #[error("transmit failure: {0}")]
    Transmit(#[from] LinkError),

    /// Invalid topology description
    #[error("topology: {0}")]
    Topology(#[from] TopologyError),

    /// Invalid link-layer configuration
    #[error("configuration: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl RoutingError {
    /// Drop counter a failed inbound frame is booked under
    pub fn drop_reason(&self) -> DropReason {
        match self {
            RoutingError::MalformedFrame(_) | RoutingError::Oversized { .. } => {
                DropReason::Malformed
            }
            RoutingError::Unmirrored(_) => DropReason::Unmirrored,
            RoutingError::Unreachable(_) | RoutingError::UnresolvedHop(_) => DropReason::NoRoute,
            RoutingError::UnknownSender(_) | RoutingError::UnknownLink(_) => {
                DropReason::UnknownOrigin
            }
            RoutingError::Reassembly(_) => DropReason::SequenceViolation,
            RoutingError::NoLinkLayer(_)
            | RoutingError::Transmit(_)
            | RoutingError::Segment(_) => DropReason::TransmitFailure,
            RoutingError::Topology(_) | RoutingError::Configuration(_) => DropReason::Configuration,
        }
    }
}
