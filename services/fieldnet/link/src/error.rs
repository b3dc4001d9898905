//! Link-layer errors.

use thiserror::Error;

/// Runtime errors of a link layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// No peer is attached to the link
    #[error("{protocol} link on port {port} is not connected")]
    NotConnected {
        /// Protocol identifier
        protocol: String,
        /// Local port
        port: u8,
    },

    /// The in-memory channel already has two endpoints
    #[error("memory channel {0} already has two endpoints")]
    ChannelFull(String),

    /// The link was started twice
    #[error("link on port {0} already started")]
    AlreadyStarted(u8),

    /// The ingress pipeline has shut down
    #[error("ingress pipeline closed")]
    Closed,
}

/// Errors raised while binding ports to link layers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// No factory registered under this identifier
    #[error("unknown link protocol: {0}")]
    UnknownProtocol(String),

    /// A required link-layer property is absent
    #[error("{protocol} link on port {port} requires property '{name}'")]
    MissingProperty {
        /// Protocol identifier
        protocol: String,
        /// Local port
        port: u8,
        /// Property name
        name: String,
    },
}
