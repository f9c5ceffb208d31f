//! # Partition Pump
//!
//! Keeps one partition flowing into the channel a consumer drains. A receive
//! fault is reported downstream as a batch error, the link is closed and then
//! reopened just past the last event seen, so a forced detach or an ownership
//! steal never silences a partition for good. Only cancellation, or the
//! consumer dropping its end of the channel, stops a pump.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ingestors::consumer::ReceivedEvent;

/// Annotation carrying an event's position within its partition.
pub const OFFSET_ANNOTATION: &str = "x-opt-offset";

/// Annotation carrying the broker enqueue time.
pub const ENQUEUED_TIME_ANNOTATION: &str = "x-opt-enqueued-time";

/// Where a partition link starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Only events enqueued after the link is attached.
    Latest,
    /// Events following the one at this offset.
    AfterOffset(String),
    /// Events enqueued strictly after this instant.
    EnqueuedAfter(DateTime<Utc>),
}

impl StartPosition {
    /// The selector-filter expression the broker evaluates for this position.
    pub fn selector(&self) -> String {
        match self {
            Self::Latest => format!("amqp.annotation.{} > '@latest'", OFFSET_ANNOTATION),
            Self::AfterOffset(offset) => format!("amqp.annotation.{} > '{}'", OFFSET_ANNOTATION, offset),
            Self::EnqueuedAfter(time) => {
                format!("amqp.annotation.{} > '{}'", ENQUEUED_TIME_ANNOTATION, time.timestamp_millis())
            }
        }
    }

    /// Moves the position past `event`. The offset is preferred; events
    /// carrying neither annotation leave the position unchanged.
    pub fn advance(&mut self, event: &ReceivedEvent) {
        if let Some(offset) = event.system_properties.get(OFFSET_ANNOTATION) {
            *self = Self::AfterOffset(offset.clone());
        } else if let Some(time) = event.enqueued_time_utc {
            *self = Self::EnqueuedAfter(time);
        }
    }
}

/// Delay between attempts to reopen a failed partition link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First delay, and the delay again once an event has arrived.
    pub base_delay: Duration,
    /// Upper bound of the doubling delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60000),
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Opens receiving links on single partitions.
#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// Attaches a receiver on `partition_id` starting at `position`.
    async fn open(&self, partition_id: &str, position: &StartPosition) -> Result<Box<dyn PartitionLink>>;
}

/// One attached partition receiver.
#[async_trait]
pub trait PartitionLink: Send {
    /// Waits for the next event. An error means the link is no longer usable.
    async fn recv(&mut self) -> Result<ReceivedEvent>;

    /// Detaches the link. Failures are only worth a log line.
    async fn close(&mut self);
}

/// Runs one partition until `cancel` fires or `events` is closed.
pub async fn run_partition_pump(
    partition_id: String,
    source: Arc<dyn PartitionSource>,
    events: mpsc::Sender<Result<ReceivedEvent>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut position = StartPosition::Latest;
    let mut delay = retry.base_delay;

    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = source.open(&partition_id, &position) => opened,
        };
        let mut link = match opened {
            Ok(link) => link,
            Err(e) => {
                log::warn!("Partition {}: could not open receiver, retrying in {:?}: {}", partition_id, delay, e);
                if !forward(&events, Err(e), &cancel).await || !pause(delay, &cancel).await {
                    return;
                }
                delay = retry.next_delay(delay);
                continue;
            }
        };
        log::debug!("Partition {}: receiving from {:?}", partition_id, position);

        let fault = loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => None,
                received = link.recv() => Some(received),
            };
            match received {
                Some(Ok(event)) => {
                    delay = retry.base_delay;
                    position.advance(&event);
                    if !forward(&events, Ok(event), &cancel).await {
                        link.close().await;
                        return;
                    }
                }
                Some(Err(e)) => break e,
                None => {
                    link.close().await;
                    return;
                }
            }
        };

        link.close().await;
        log::warn!("Partition {}: receiver failed, reopening in {:?}: {}", partition_id, delay, fault);
        if !forward(&events, Err(fault), &cancel).await || !pause(delay, &cancel).await {
            return;
        }
        delay = retry.next_delay(delay);
    }
}

/// Hands an item to the consumer. `false` once the pump should stop.
async fn forward(
    events: &mpsc::Sender<Result<ReceivedEvent>>,
    item: Result<ReceivedEvent>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = events.send(item) => sent.is_ok(),
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
