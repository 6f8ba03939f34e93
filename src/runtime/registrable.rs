//! Registrable: multiplexes one transport/channel over several upper-layer
//! clients, each addressed by an integer `callback_id` assigned in
//! registration order (spec.md §3 "Callback registration", §4.1
//! "Registrable").
//!
//! `Link` uses this to hand each of PFD/BEB/ERB its own channel over the one
//! underlying socket; `BestEffortBroadcast`/`EagerReliableBroadcast` reuse it
//! to let several `HierarchicalConsensus` instances share one broadcast
//! channel (as the reference implementation's `MajorityVoting` shares a
//! single best-effort broadcast between its main consensus instance and its
//! leader-election consensus instance).
//!
//! A registrant gets back its `callback_id` plus an [`mpsc::UnboundedReceiver`]
//! and is expected to drive its own task off it — this keeps delivery order
//! per registrant FIFO without requiring the registry itself to know
//! anything about how a registrant processes what it's given.

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub struct ChannelRegistry<T> {
    clients: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Send + 'static> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ChannelRegistry<T> {
    pub fn new() -> Self {
        ChannelRegistry {
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new client, returning its `callback_id` and the receiving
    /// half it should drain. The same wiring order at every peer assigns the
    /// same id to the same logical client everywhere (spec.md §3 invariant).
    pub fn register(&self) -> (u32, mpsc::UnboundedReceiver<T>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut clients = self.clients.lock();
        clients.push(sender);
        ((clients.len() - 1) as u32, receiver)
    }

    /// Routes `value` to the client registered under `callback_id`. An
    /// unknown id (stale registration, peer desync) is logged and dropped by
    /// the caller, never treated as fatal — spec.md §7.
    pub fn dispatch(&self, callback_id: u32, value: T) -> bool {
        let clients = self.clients.lock();
        match clients.get(callback_id as usize) {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_order_determines_callback_id() {
        let registry: ChannelRegistry<u32> = ChannelRegistry::new();
        let (id_a, mut rx_a) = registry.register();
        let (id_b, mut rx_b) = registry.register();
        assert_eq!(id_a, 0);
        assert_eq!(id_b, 1);

        assert!(registry.dispatch(id_b, 42));
        assert_eq!(rx_b.recv().await, Some(42));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn dispatch_to_unknown_id_is_reported_not_fatal() {
        let registry: ChannelRegistry<u32> = ChannelRegistry::new();
        let (_id, _rx) = registry.register();
        assert!(!registry.dispatch(7, 1));
    }
}
