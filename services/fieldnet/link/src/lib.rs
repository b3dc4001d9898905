//! Link layers and the ingress pipeline for fieldnet.
//!
//! A link layer carries complete frames over one local port. It is created
//! from a protocol identifier through the [`ProtocolRegistry`] and reports
//! everything it receives to an [`IngressSender`]; the routing layer consumes
//! those events on a single worker task.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ingress;
pub mod layer;
pub mod memory;

// Re-export main types
pub use error::{ConfigurationError, LinkError};
pub use ingress::{
    IngressConfig, IngressEvent, IngressHandler, IngressPipeline, IngressSender,
    DEFAULT_INGRESS_CAPACITY,
};
pub use layer::{LinkFactory, LinkLayer, LinkSettings, ProtocolRegistry};
pub use memory::MemoryLink;
