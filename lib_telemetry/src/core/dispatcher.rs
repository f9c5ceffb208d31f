//! # Broadcast Hub
//!
//! Fans a single serialized payload out to every connected client.
//!
//! ## Design
//!
//! 1.  **Zero-Copy Fan-out**: the payload is wrapped in one `Arc<str>` and every
//!     client receives a clone of the pointer, not of the text.
//!
//! 2.  **Failure Isolation**: a failed push is logged and the loop moves on to
//!     the next client. Closed clients are skipped without an error and without
//!     queueing anything for later.
//!
//! 3.  **Passive Cleanup**: clients observed closed during a pass are dropped
//!     from the registry once the pass is over. The hub never closes a client.

use std::sync::{Arc, Mutex};

use crate::core::client::ClientConnection;

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients the payload was handed to.
    pub delivered: usize,
    /// Open clients whose push failed.
    pub failed: usize,
    /// Clients skipped because they were not open.
    pub skipped: usize,
}

/// Registry of connected clients plus the fan-out over it.
#[derive(Default)]
pub struct BroadcastHub {
    clients: Mutex<Vec<Arc<dyn ClientConnection>>>,
}

impl BroadcastHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `client` eligible for every broadcast from now on.
    pub fn register(&self, client: Arc<dyn ClientConnection>) {
        let mut clients = self.clients.lock().expect("BroadcastHub lock poisoned");
        log::info!("Client '{}' registered ({} connected)", client.id(), clients.len() + 1);
        clients.push(client);
    }

    /// Removes a client by id. Returns whether it was present.
    pub fn unregister(&self, id: &str) -> bool {
        let mut clients = self.clients.lock().expect("BroadcastHub lock poisoned");
        let before = clients.len();
        clients.retain(|c| c.id() != id);
        let removed = clients.len() != before;
        if removed {
            log::info!("Client '{}' removed ({} connected)", id, clients.len());
        }
        removed
    }

    /// Number of registered clients, open or not.
    pub fn len(&self) -> usize {
        self.clients.lock().expect("BroadcastHub lock poisoned").len()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes `payload` to every open client.
    pub fn broadcast(&self, payload: &str) -> BroadcastReport {
        let frame: Arc<str> = Arc::from(payload);
        let mut report = BroadcastReport::default();
        let mut clients = self.clients.lock().expect("BroadcastHub lock poisoned");

        for client in clients.iter() {
            if !client.is_open() {
                report.skipped += 1;
                continue;
            }
            match client.send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    log::error!("{}", e);
                }
            }
        }

        if report.skipped > 0 || report.failed > 0 {
            clients.retain(|client| {
                let open = client.is_open();
                if !open {
                    log::debug!("Client '{}' is closed. Removing from hub.", client.id());
                }
                open
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::ChannelClient;
    use crate::error::{RelayError, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Open client whose every push fails.
    struct BrokenClient {
        attempts: AtomicUsize,
    }

    impl ClientConnection for BrokenClient {
        fn id(&self) -> &str {
            "broken"
        }

        fn is_open(&self) -> bool {
            true
        }

        fn send(&self, _payload: Arc<str>) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::BroadcastSend {
                client: "broken".to_string(),
                reason: "socket write failed".to_string(),
            })
        }
    }

    #[test]
    fn sends_only_to_open_clients() {
        let hub = BroadcastHub::new();
        let (open, mut open_rx) = ChannelClient::new("open");
        let (closed, closed_rx) = ChannelClient::new("closed");
        drop(closed_rx);
        hub.register(Arc::new(closed));
        hub.register(Arc::new(open));

        let report = hub.broadcast("p");
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0, skipped: 1 });
        assert_eq!(open_rx.try_recv().unwrap().as_ref(), "p");
        assert!(open_rx.try_recv().is_err());

        // The closed client was purged after the pass.
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn a_failing_client_does_not_block_the_rest() {
        let hub = BroadcastHub::new();
        let broken = Arc::new(BrokenClient { attempts: AtomicUsize::new(0) });
        let (before, mut before_rx) = ChannelClient::new("before");
        let (after, mut after_rx) = ChannelClient::new("after");
        hub.register(Arc::new(before));
        hub.register(broken.clone());
        hub.register(Arc::new(after));

        let report = hub.broadcast("x");
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1, skipped: 0 });
        assert_eq!(before_rx.try_recv().unwrap().as_ref(), "x");
        assert_eq!(after_rx.try_recv().unwrap().as_ref(), "x");
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);

        // Still open, so it stays registered and is tried again.
        hub.broadcast("y");
        assert_eq!(broken.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(hub.len(), 3);
    }

    #[test]
    fn clients_receive_payloads_in_broadcast_order() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = ChannelClient::new("c");
        hub.register(Arc::new(client));
        for p in ["1", "2", "3"] {
            hub.broadcast(p);
        }
        let got: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|p| p.to_string()).collect();
        assert_eq!(got, ["1", "2", "3"]);
    }

    #[test]
    fn unregister_removes_by_id() {
        let hub = BroadcastHub::new();
        let (client, _rx) = ChannelClient::new("c");
        hub.register(Arc::new(client));
        assert!(hub.unregister("c"));
        assert!(!hub.unregister("c"));
        assert!(hub.is_empty());
        assert_eq!(hub.broadcast("p"), BroadcastReport::default());
    }
}
