//! # Integration Test Fixtures
//!
//! In-memory stand-ins for the IoT Hub bootstrap connection and the Event Hubs
//! consumer, so the whole relay can be driven without a broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lib_telemetry::StreamEndpoint;
use lib_telemetry::error::{RelayError, Result};
use lib_telemetry::ingestors::{ConsumerFactory, EventConsumer, NextBatch, ReceivedEvent};
use lib_telemetry::resolver::transport::{BootstrapConnection, BootstrapOptions, BootstrapTransport, LinkError};
use tokio::sync::mpsc;

/// Base64 shared access key used across the integration tests.
pub const TEST_KEY: &str = "8Ll3qNz0m2W7YUbGilYRIUdfeWYXaCV8lAIoTAfZ5M8=";

/// Connection string for `h.azure-devices.net` signed with [`TEST_KEY`].
pub fn test_connection_string() -> String {
    format!(
        "HostName=h.azure-devices.net;SharedAccessKeyName=service;SharedAccessKey={}",
        TEST_KEY
    )
}

/// A bootstrap transport that answers every attach with a fixed link error.
pub struct RedirectingTransport {
    answer: LinkError,
    /// Number of connections opened so far.
    pub connects: AtomicUsize,
    /// Options of the most recent connection.
    pub last_options: Mutex<Option<BootstrapOptions>>,
}

impl RedirectingTransport {
    /// Redirects to `hostname` with `address`.
    pub fn redirect(hostname: &str, address: &str) -> Arc<Self> {
        Self::answering(LinkError::redirect(hostname, address))
    }

    /// Rejects every attach with `answer`.
    pub fn answering(answer: LinkError) -> Arc<Self> {
        Arc::new(Self {
            answer,
            connects: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BootstrapTransport for RedirectingTransport {
    async fn connect(&self, options: BootstrapOptions) -> std::result::Result<Box<dyn BootstrapConnection>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().expect("options lock poisoned") = Some(options);
        Ok(Box::new(RejectingConnection {
            answer: self.answer.clone(),
        }))
    }
}

struct RejectingConnection {
    answer: LinkError,
}

#[async_trait]
impl BootstrapConnection for RejectingConnection {
    async fn attach_receiver(&mut self, _address: &str) -> std::result::Result<(), LinkError> {
        Err(self.answer.clone())
    }

    async fn next_link_error(&mut self) -> Option<LinkError> {
        None
    }

    async fn close(&mut self) -> std::result::Result<(), LinkError> {
        Ok(())
    }
}

/// Feeds batches pushed through a channel to a single consumer.
pub struct ChannelConsumerFactory {
    batches: Mutex<Option<mpsc::UnboundedReceiver<Result<Vec<ReceivedEvent>>>>>,
    /// Endpoint and consumer group of the most recent `create`.
    pub last_request: Mutex<Option<(StreamEndpoint, String)>>,
    /// Number of consumers closed so far.
    pub closes: Arc<AtomicUsize>,
}

impl ChannelConsumerFactory {
    /// Returns the factory and the sender batches are pushed through. Dropping
    /// the sender ends the subscription.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<Vec<ReceivedEvent>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            batches: Mutex::new(Some(rx)),
            last_request: Mutex::new(None),
            closes: Arc::new(AtomicUsize::new(0)),
        });
        (factory, tx)
    }
}

#[async_trait]
impl ConsumerFactory for ChannelConsumerFactory {
    async fn create(&self, endpoint: &StreamEndpoint, consumer_group: &str) -> Result<Box<dyn EventConsumer>> {
        *self.last_request.lock().expect("request lock poisoned") = Some((endpoint.clone(), consumer_group.to_string()));
        let batches = self
            .batches
            .lock()
            .expect("batches lock poisoned")
            .take()
            .ok_or_else(|| RelayError::Subscription("consumer already created".to_string()))?;
        Ok(Box::new(ChannelConsumer {
            batches,
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct ChannelConsumer {
    batches: mpsc::UnboundedReceiver<Result<Vec<ReceivedEvent>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl EventConsumer for ChannelConsumer {
    async fn partition_ids(&mut self) -> Result<Vec<String>> {
        Ok((0..4).map(|i| i.to_string()).collect())
    }

    async fn next_batch(&mut self) -> NextBatch {
        self.batches.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An event as IoT Hub stamps it: body plus the device id system property.
pub fn device_event(body: &[u8], device_id: Option<&str>) -> ReceivedEvent {
    let mut event = ReceivedEvent {
        body: body.to_vec(),
        ..ReceivedEvent::default()
    };
    if let Some(id) = device_id {
        event
            .system_properties
            .insert(lib_telemetry::ingestors::DEVICE_ID_PROPERTY.to_string(), id.to_string());
    }
    event
}
