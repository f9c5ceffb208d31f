//! # Data Ingestors Module
//!
//! Everything that brings telemetry into the relay: the consumer seam an Event
//! Hubs client implements, and the [`StreamReader`] that drives it.

/// Consumer and factory traits plus the raw event shape.
pub mod consumer;
/// Per-partition receive loop that reopens failed links.
pub mod partition_pump;
/// Partition subscription and in-order handler delivery.
pub mod stream_reader;

pub use consumer::{ConsumerFactory, EventConsumer, NextBatch, ReceivedEvent};
pub use partition_pump::{PartitionLink, PartitionSource, RetryPolicy, StartPosition, run_partition_pump};
pub use stream_reader::{DEVICE_ID_PROPERTY, PartitionEvent, StreamReader};
