//! # Stream Reader
//!
//! Subscribes to every partition of the resolved Event Hub under one consumer
//! group and hands each event to a handler, in batch order, one at a time.
//!
//! Delivery runs on a dedicated task. A batch is always drained completely
//! before cancellation is observed. A faulty batch is logged without ending the
//! subscription, and a panicking handler only loses the event it was given.
//! There is no checkpointing: where a new start begins reading is up to the
//! consumer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::StreamEndpoint;
use crate::error::{RelayError, Result};
use crate::ingestors::consumer::{ConsumerFactory, EventConsumer, ReceivedEvent};

/// System property IoT Hub stamps with the sending device's id.
pub const DEVICE_ID_PROPERTY: &str = "iothub-connection-device-id";

/// One event as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEvent {
    /// Raw body.
    pub body: Vec<u8>,
    /// Broker enqueue time.
    pub enqueued_time_utc: Option<DateTime<Utc>>,
    /// Id of the originating device.
    pub origin_id: Option<String>,
}

impl From<ReceivedEvent> for PartitionEvent {
    fn from(mut event: ReceivedEvent) -> Self {
        Self {
            origin_id: event.system_properties.remove(DEVICE_ID_PROPERTY),
            body: event.body,
            enqueued_time_utc: event.enqueued_time_utc,
        }
    }
}

struct Subscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Reads all partitions of an Event Hub and feeds a handler.
pub struct StreamReader {
    factory: Arc<dyn ConsumerFactory>,
    active: Option<Subscription>,
}

impl StreamReader {
    /// Creates an idle reader.
    pub fn new(factory: Arc<dyn ConsumerFactory>) -> Self {
        Self { factory, active: None }
    }

    /// Whether a delivery task is currently running.
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Creates a consumer and starts delivering events to `handler`.
    ///
    /// # Errors
    /// [`RelayError::Subscription`] when a subscription is already running or the
    /// consumer cannot be created.
    pub async fn start<H>(&mut self, endpoint: &StreamEndpoint, consumer_group: &str, mut handler: H) -> Result<()>
    where
        H: FnMut(PartitionEvent) + Send + 'static,
    {
        if self.is_running() {
            return Err(RelayError::Subscription("stream reader already started".to_string()));
        }
        self.active = None;

        let mut consumer = self.factory.create(endpoint, consumer_group).await?;
        log::info!(
            "Successfully created the Event Hubs consumer for '{}' (consumer group '{}').",
            endpoint.entity_path,
            consumer_group
        );

        match consumer.partition_ids().await {
            Ok(ids) => log::info!("The partition ids are: {:?}", ids),
            Err(e) => log::warn!("Could not list partition ids: {}", e),
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = consumer.next_batch() => next,
                };
                match next {
                    Some(Ok(batch)) => {
                        log::trace!("Delivering batch of {} events", batch.len());
                        for event in batch {
                            deliver(&mut handler, PartitionEvent::from(event));
                        }
                    }
                    Some(Err(e)) => log::error!("{}", e),
                    None => {
                        log::warn!("Event subscription ended by the consumer.");
                        break;
                    }
                }
            }
            close_consumer(consumer.as_mut()).await;
        });

        self.active = Some(Subscription { cancel, task });
        Ok(())
    }

    /// Stops delivery and closes the consumer. Without a running consumer this
    /// only logs a warning.
    pub async fn stop(&mut self) {
        let Some(subscription) = self.active.take().filter(|s| !s.task.is_finished()) else {
            log::warn!("No Event Hubs consumer to close.");
            return;
        };
        subscription.cancel.cancel();
        if let Err(e) = subscription.task.await {
            log::error!("Event delivery task ended abnormally: {}", e);
        }
    }
}

/// Runs the handler for one event. A panic is logged and confined to that
/// event so the subscription and its consumer outlive it.
fn deliver<H: FnMut(PartitionEvent)>(handler: &mut H, event: PartitionEvent) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!("Event handler panicked: {}", reason);
    }
}

async fn close_consumer(consumer: &mut dyn EventConsumer) {
    match consumer.close().await {
        Ok(()) => log::info!("Event Hubs consumer closed."),
        Err(e) => log::error!("Error closing Event Hubs consumer: {}", e),
    }
}
