//! Topology validation errors.

use crate::DeviceAddr;
use thiserror::Error;

/// Errors raised while loading a topology description
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Device declared twice
    #[error("device {0} declared more than once")]
    DuplicateDevice(DeviceAddr),

    /// Partner references a device that is not declared
    #[error("device {0} is referenced but not declared")]
    UnknownDevice(DeviceAddr),

    /// The local device is missing from the description
    #[error("local device {0} is not part of the topology")]
    MissingLocalDevice(DeviceAddr),

    /// Port address outside 1..=254
    #[error("device {device}: port {port} outside 1..=254")]
    InvalidPort {
        /// Device owning the port
        device: DeviceAddr,
        /// Offending port address
        port: u8,
    },

    /// Port declared twice on one device
    #[error("device {device}: port {port} declared more than once")]
    DuplicatePort {
        /// Device owning the port
        device: DeviceAddr,
        /// Offending port address
        port: u8,
    },

    /// Two links share the same (device, port, remote port) key
    #[error("device {device}: link {port}->{remote_port} declared more than once")]
    DuplicateLink {
        /// Origin device
        device: DeviceAddr,
        /// Local port
        port: u8,
        /// Remote port
        remote_port: u8,
    },

    /// A locally terminated port has partners but no link-layer protocol
    #[error("local port {0} has partners but names no protocol")]
    MissingProtocol(u8),
}
