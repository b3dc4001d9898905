//! Application-facing listener contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use fieldnet_topology::DeviceAddr;
use tokio::sync::mpsc;

/// Receiver of telegrams and link-state changes
pub trait TelegramListener: Send + Sync {
    /// A telegram addressed to the local device arrived
    fn on_telegram(&self, sender: DeviceAddr, payload: Bytes, is_long: bool);

    /// A link towards `device` came up or went down
    fn on_link_state_changed(&self, device: DeviceAddr, connected: bool);
}

/// Listener callback captured as a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// See [`TelegramListener::on_telegram`]
    Telegram {
        /// Sending device
        sender: DeviceAddr,
        /// OSI-7 payload
        payload: Bytes,
        /// Whether the payload was reassembled from fragments
        is_long: bool,
    },
    /// See [`TelegramListener::on_link_state_changed`]
    LinkState {
        /// Device at the far end of the link
        device: DeviceAddr,
        /// New state
        connected: bool,
    },
}

impl TelegramListener for mpsc::UnboundedSender<Delivery> {
    fn on_telegram(&self, sender: DeviceAddr, payload: Bytes, is_long: bool) {
        let _ = self.send(Delivery::Telegram {
            sender,
            payload,
            is_long,
        });
    }

    fn on_link_state_changed(&self, device: DeviceAddr, connected: bool) {
        let _ = self.send(Delivery::LinkState { device, connected });
    }
}

/// Handle returned when a listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    entries: DashMap<u64, Arc<dyn TelegramListener>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn TelegramListener>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, listener);
        ListenerId(id)
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    fn snapshot(&self) -> Vec<Arc<dyn TelegramListener>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn telegram(&self, sender: DeviceAddr, payload: Bytes, is_long: bool) {
        for listener in self.snapshot() {
            listener.on_telegram(sender, payload.clone(), is_long);
        }
    }

    pub(crate) fn link_state(&self, device: DeviceAddr, connected: bool) {
        for listener in self.snapshot() {
            listener.on_link_state_changed(device, connected);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener() {
        let listeners = Listeners::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = listeners.add(Arc::new(tx));

        listeners.telegram(DeviceAddr(4), Bytes::from_static(b"abc"), false);
        listeners.link_state(DeviceAddr(5), true);

        assert_eq!(
            rx.try_recv().unwrap(),
            Delivery::Telegram {
                sender: DeviceAddr(4),
                payload: Bytes::from_static(b"abc"),
                is_long: false
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Delivery::LinkState {
                device: DeviceAddr(5),
                connected: true
            }
        );

        assert!(listeners.remove(id));
        listeners.telegram(DeviceAddr(4), Bytes::new(), false);
        assert!(rx.try_recv().is_err());
    }
}
