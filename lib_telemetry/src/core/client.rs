//! # Client Connections
//!
//! A client is anything that can accept a text payload and report whether it is
//! still open. The hub never closes a client; it only stops writing to closed ones.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

/// A push channel to one connected client.
pub trait ClientConnection: Send + Sync {
    /// Stable identifier, used for logging and explicit removal.
    fn id(&self) -> &str;

    /// Whether the underlying channel is still open.
    fn is_open(&self) -> bool;

    /// Pushes one payload without waiting for the client.
    fn send(&self, payload: Arc<str>) -> Result<()>;
}

/// A client backed by an unbounded channel drained by the socket's writer task.
///
/// The connection is open for as long as the receiving half is alive, so a
/// writer task that exits (socket closed, write failed) closes it implicitly.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    id: String,
    sender: mpsc::UnboundedSender<Arc<str>>,
}

impl ChannelClient {
    /// Creates a client and returns the receiver its writer task should drain.
    pub fn new(id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Arc<str>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { id: id.into(), sender }, receiver)
    }
}

impl ClientConnection for ChannelClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn send(&self, payload: Arc<str>) -> Result<()> {
        self.sender.send(payload).map_err(|_| RelayError::BroadcastSend {
            client: self.id.clone(),
            reason: "client channel closed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_until_receiver_dropped() {
        let (client, rx) = ChannelClient::new("c1");
        assert!(client.is_open());
        client.send(Arc::from("hello")).unwrap();
        drop(rx);
        assert!(!client.is_open());
        assert!(matches!(
            client.send(Arc::from("again")),
            Err(RelayError::BroadcastSend { .. })
        ));
    }
}
