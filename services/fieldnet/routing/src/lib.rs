//! OSI-3 routing and dispatch for fieldnet.
//!
//! [`Osi3Router`] ties the pieces together: it computes routes from the
//! topology, writes headers on the way out, forwards transit frames, traces
//! the sender of terminating frames and hands telegrams to registered
//! [`TelegramListener`]s. Long telegrams are cut by the segmenter on the way
//! out and rebuilt by the reassembler on the ingress worker.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod inbound;
pub mod listener;
pub mod router;
pub mod stats;

#[cfg(test)]
mod tests;

// Re-export main types
pub use error::RoutingError;
pub use inbound::InboundHandler;
pub use listener::{Delivery, ListenerId, TelegramListener};
pub use router::{Osi3Router, RouterConfig, Transmitter, REDUCE_PROPERTY, REFLECT_PROPERTY};
pub use stats::{DropReason, RouterStats};
