//! # Event Consumer Seam
//!
//! What the stream reader needs from an Event Hubs client: create a consumer for
//! an endpoint and consumer group, list partitions, hand over batches, close.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::connection::StreamEndpoint;
use crate::error::{RelayError, Result};

/// One event as delivered by the consumer, before the reader interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedEvent {
    /// Raw body.
    pub body: Vec<u8>,
    /// Broker enqueue time, when the service stamped one.
    pub enqueued_time_utc: Option<DateTime<Utc>>,
    /// String-valued system properties and annotations.
    pub system_properties: HashMap<String, String>,
}

/// Result of waiting for the next batch: `None` once the subscription is over.
pub type NextBatch = Option<Result<Vec<ReceivedEvent>>>;

/// A live subscription spanning every partition of one Event Hub.
#[async_trait]
pub trait EventConsumer: Send {
    /// Partition identifiers of the Event Hub.
    async fn partition_ids(&mut self) -> Result<Vec<String>>;

    /// Waits for the next batch. Errors are per-batch faults, not the end of
    /// the subscription.
    async fn next_batch(&mut self) -> NextBatch;

    /// Releases the consumer.
    async fn close(&mut self) -> Result<()>;
}

/// Creates consumers bound to an endpoint and consumer group.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    /// Opens a consumer.
    async fn create(&self, endpoint: &StreamEndpoint, consumer_group: &str) -> Result<Box<dyn EventConsumer>>;
}

/// Helper for consumers that need to flag a batch fault.
pub fn subscription_error(message: impl Into<String>) -> RelayError {
    RelayError::Subscription(message.into())
}
