//! # Relay
//!
//! The composition root: resolves the Event Hubs endpoint once, subscribes the
//! stream reader, and turns every event into a client broadcast.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::connection::{ConnectionDescriptor, StreamEndpoint};
use crate::core::dispatcher::{BroadcastHub, BroadcastReport};
use crate::core::payload::OutboundPayload;
use crate::error::Result;
use crate::ingestors::{PartitionEvent, StreamReader};
use crate::resolver::EndpointResolver;

/// Maps one event to its payload and fans it out. Returns `None` when the
/// payload could not be serialized; the event is then dropped.
pub fn relay_event(hub: &BroadcastHub, event: PartitionEvent, now: DateTime<Utc>) -> Option<BroadcastReport> {
    let payload = OutboundPayload::from_event(event, now);
    match payload.to_json() {
        Ok(json) => {
            log::debug!("Broadcasting data {}", json);
            Some(hub.broadcast(&json))
        }
        Err(e) => {
            log::error!("Error broadcasting: [{}] from [{}].", e, payload.iot_data);
            None
        }
    }
}

/// Wires the resolver, the reader and the hub together.
pub struct Relay {
    resolver: EndpointResolver,
    reader: StreamReader,
    hub: Arc<BroadcastHub>,
    endpoint: Option<StreamEndpoint>,
}

impl Relay {
    /// Creates a relay that has not resolved anything yet.
    pub fn new(resolver: EndpointResolver, reader: StreamReader, hub: Arc<BroadcastHub>) -> Self {
        Self {
            resolver,
            reader,
            hub,
            endpoint: None,
        }
    }

    /// The hub clients register with.
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// The resolved endpoint, once [`Relay::start`] has succeeded.
    pub fn endpoint(&self) -> Option<&StreamEndpoint> {
        self.endpoint.as_ref()
    }

    /// Whether events are currently flowing.
    pub fn is_running(&self) -> bool {
        self.reader.is_running()
    }

    /// Resolves the endpoint (first call only) and starts relaying.
    ///
    /// # Errors
    /// Resolution errors are fatal for the run and are returned unchanged, as are
    /// consumer creation failures.
    pub async fn start(&mut self, descriptor: &ConnectionDescriptor, consumer_group: &str) -> Result<&StreamEndpoint> {
        let endpoint = match self.endpoint.take() {
            Some(endpoint) => endpoint,
            None => self.resolver.resolve(descriptor).await?,
        };

        let hub = Arc::clone(&self.hub);
        let started = self
            .reader
            .start(&endpoint, consumer_group, move |event| {
                relay_event(&hub, event, Utc::now());
            })
            .await;

        // Kept even when the subscription failed: resolution happens once per process.
        let endpoint: &StreamEndpoint = self.endpoint.insert(endpoint);
        started?;
        Ok(endpoint)
    }

    /// Stops the subscription. Connected clients stay connected.
    pub async fn stop(&mut self) {
        self.reader.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::ChannelClient;
    use chrono::TimeZone;

    #[test]
    fn relay_event_pushes_the_json_payload() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = ChannelClient::new("c");
        hub.register(Arc::new(client));

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let report = relay_event(
            &hub,
            PartitionEvent {
                body: b"42".to_vec(),
                enqueued_time_utc: None,
                origin_id: Some("dev-1".to_string()),
            },
            now,
        )
        .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(
            rx.try_recv().unwrap().as_ref(),
            r#"{"IotData":"42","MessageDate":"2024-03-01T12:00:00.000Z","DeviceId":"dev-1"}"#
        );
    }
}
