//! Event Hubs consumer over plain AMQP links.
//!
//! One receiver is attached per partition at
//! `<entityPath>/ConsumerGroups/<group>/Partitions/<id>`, filtered on the broker
//! side with an `apache.org:selector-filter:string` so history is never sent.
//! Each partition runs in its own [`run_partition_pump`] task, which reopens
//! the link after a fault, and forwards events into a shared channel that
//! [`AmqpEventConsumer::next_batch`] drains.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::annotations::OwnedKey;
use fe2o3_amqp::types::messaging::{
    AmqpValue, ApplicationProperties, Body, Message, MessageAnnotations, Properties, Source,
};
use fe2o3_amqp::types::primitives::{SimpleValue, Symbol, Value};
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use serde_amqp::described::Described;
use serde_amqp::descriptor::Descriptor;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::amqp::CONTAINER_ID;
use crate::connection::StreamEndpoint;
use crate::error::{RelayError, Result};
use crate::ingestors::consumer::{ConsumerFactory, EventConsumer, NextBatch, ReceivedEvent, subscription_error};
use crate::ingestors::partition_pump::{
    ENQUEUED_TIME_ANNOTATION, PartitionLink, PartitionSource, RetryPolicy, StartPosition, run_partition_pump,
};
use crate::resolver::transport::AMQPS_PORT;

/// Upper bound on the events returned by one `next_batch` call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// How long the `$management` partition listing may take.
pub const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(30);

const SELECTOR_FILTER: &str = "apache.org:selector-filter:string";
const MANAGEMENT_ADDRESS: &str = "$management";
const MANAGEMENT_REPLY_TO: &str = "telemetry-mgmt-reply";

type SharedSession = Arc<Mutex<SessionHandle<()>>>;

/// Builds [`AmqpEventConsumer`]s.
#[derive(Debug, Clone, Copy)]
pub struct AmqpConsumerFactory {
    max_batch_size: usize,
    retry: RetryPolicy,
}

impl Default for AmqpConsumerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE)
    }
}

impl AmqpConsumerFactory {
    /// Creates a factory whose consumers return at most `max_batch_size` events per batch.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the delays used when a partition link is reopened.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl ConsumerFactory for AmqpConsumerFactory {
    async fn create(&self, endpoint: &StreamEndpoint, consumer_group: &str) -> Result<Box<dyn EventConsumer>> {
        let url = format!("amqps://{}:{}", endpoint.host, AMQPS_PORT);
        let mut connection = Connection::builder()
            .container_id(CONTAINER_ID)
            .hostname(endpoint.host.as_str())
            .alt_tls_establishment(true)
            .sasl_profile(SaslProfile::Plain {
                username: endpoint.key_name.clone(),
                password: endpoint.key.clone(),
            })
            .open(url.as_str())
            .await
            .map_err(|e| subscription_error(format!("cannot connect to {}: {}", endpoint.host, e)))?;

        let mut session = match Session::begin(&mut connection).await {
            Ok(session) => session,
            Err(e) => {
                let _ = connection.close().await;
                return Err(subscription_error(format!("cannot begin session: {}", e)));
            }
        };

        let listed = tokio::time::timeout(MANAGEMENT_TIMEOUT, read_partition_ids(&mut session, &endpoint.entity_path))
            .await
            .unwrap_or_else(|_| {
                Err(subscription_error(format!(
                    "$management: no answer within {:?}",
                    MANAGEMENT_TIMEOUT
                )))
            });
        let partition_ids = match listed {
            Ok(ids) => ids,
            Err(e) => {
                let _ = session.end().await;
                let _ = connection.close().await;
                return Err(e);
            }
        };

        let session: SharedSession = Arc::new(Mutex::new(session));
        let source: Arc<dyn PartitionSource> = Arc::new(AmqpPartitionSource {
            session: Arc::clone(&session),
            entity_path: endpoint.entity_path.clone(),
            consumer_group: consumer_group.to_string(),
            generation: AtomicU64::new(0),
        });

        let (tx, rx) = mpsc::channel(self.max_batch_size * 4);
        let cancel = CancellationToken::new();
        let pumps = partition_ids
            .iter()
            .map(|id| {
                tokio::spawn(run_partition_pump(
                    id.clone(),
                    Arc::clone(&source),
                    tx.clone(),
                    self.retry,
                    cancel.clone(),
                ))
            })
            .collect();

        Ok(Box::new(AmqpEventConsumer {
            connection,
            session,
            partition_ids,
            queue: BatchQueue::new(rx, self.max_batch_size),
            cancel,
            pumps,
        }))
    }
}

/// A consumer reading every partition of one Event Hub.
pub struct AmqpEventConsumer {
    connection: ConnectionHandle<()>,
    session: SharedSession,
    partition_ids: Vec<String>,
    queue: BatchQueue,
    cancel: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

#[async_trait]
impl EventConsumer for AmqpEventConsumer {
    async fn partition_ids(&mut self) -> Result<Vec<String>> {
        Ok(self.partition_ids.clone())
    }

    async fn next_batch(&mut self) -> NextBatch {
        self.queue.next().await
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        for pump in self.pumps.drain(..) {
            if let Err(e) = pump.await {
                log::warn!("Partition pump ended abnormally: {}", e);
            }
        }
        let _ = self.session.lock().await.end().await;
        self.connection
            .close()
            .await
            .map_err(|e| RelayError::Close(e.to_string()))
    }
}

/// Attaches filtered partition receivers on the consumer's session.
struct AmqpPartitionSource {
    session: SharedSession,
    entity_path: String,
    consumer_group: String,
    generation: AtomicU64,
}

#[async_trait]
impl PartitionSource for AmqpPartitionSource {
    async fn open(&self, partition_id: &str, position: &StartPosition) -> Result<Box<dyn PartitionLink>> {
        let address = partition_address(&self.entity_path, &self.consumer_group, partition_id);
        let source = Source::builder()
            .address(address.clone())
            .add_to_filter(SELECTOR_FILTER, selector_filter(position))
            .build();
        // Link names must stay unique within the session across reopens.
        let name = format!(
            "partition-{}-{}",
            partition_id,
            self.generation.fetch_add(1, Ordering::Relaxed)
        );

        let mut session = self.session.lock().await;
        let receiver = Receiver::builder()
            .name(name)
            .source(source)
            .attach(&mut *session)
            .await
            .map_err(|e| subscription_error(format!("cannot attach to {}: {}", address, e)))?;
        log::debug!("Attached receiver to {} ({})", address, position.selector());

        Ok(Box::new(AmqpPartitionLink {
            partition_id: partition_id.to_string(),
            receiver: Some(receiver),
        }))
    }
}

struct AmqpPartitionLink {
    partition_id: String,
    receiver: Option<Receiver>,
}

#[async_trait]
impl PartitionLink for AmqpPartitionLink {
    async fn recv(&mut self) -> Result<ReceivedEvent> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| subscription_error(format!("partition {}: receiver closed", self.partition_id)))?;
        let delivery: Delivery<Body<Value>> = receiver
            .recv()
            .await
            .map_err(|e| subscription_error(format!("partition {}: {}", self.partition_id, e)))?;
        if let Err(e) = receiver.accept(&delivery).await {
            log::warn!("Partition {}: could not settle delivery: {}", self.partition_id, e);
        }
        let message = delivery.message();
        Ok(event_from_parts(message.message_annotations.as_ref(), &message.body))
    }

    async fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            if let Err(e) = receiver.close().await {
                log::debug!("Partition {}: receiver close failed: {}", self.partition_id, e);
            }
        }
    }
}

fn selector_filter(position: &StartPosition) -> Described<Value> {
    Described {
        descriptor: Descriptor::Name(Symbol::from(SELECTOR_FILTER)),
        value: Value::String(position.selector()),
    }
}

/// Groups the pumps' output into bounded batches. A fault ends the batch in
/// progress and is returned on the following call.
struct BatchQueue {
    events: mpsc::Receiver<Result<ReceivedEvent>>,
    pending_error: Option<RelayError>,
    max_batch_size: usize,
}

impl BatchQueue {
    fn new(events: mpsc::Receiver<Result<ReceivedEvent>>, max_batch_size: usize) -> Self {
        Self {
            events,
            pending_error: None,
            max_batch_size,
        }
    }

    async fn next(&mut self) -> NextBatch {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        let mut batch = match self.events.recv().await? {
            Ok(event) => vec![event],
            Err(e) => return Some(Err(e)),
        };
        while batch.len() < self.max_batch_size {
            match self.events.try_recv() {
                Ok(Ok(event)) => batch.push(event),
                Ok(Err(e)) => {
                    self.pending_error = Some(e);
                    break;
                }
                Err(_) => break,
            }
        }
        Some(Ok(batch))
    }
}

fn partition_address(entity_path: &str, consumer_group: &str, partition_id: &str) -> String {
    format!("{}/ConsumerGroups/{}/Partitions/{}", entity_path, consumer_group, partition_id)
}

/// Asks the `$management` node for the Event Hub's partition ids.
async fn read_partition_ids(session: &mut SessionHandle<()>, entity_path: &str) -> Result<Vec<String>> {
    let management_error = |e: &dyn std::fmt::Display| subscription_error(format!("$management: {}", e));

    let mut sender = Sender::attach(session, "mgmt-sender", MANAGEMENT_ADDRESS)
        .await
        .map_err(|e| management_error(&e))?;
    let mut receiver = Receiver::builder()
        .name("mgmt-receiver")
        .source(MANAGEMENT_ADDRESS)
        .target(MANAGEMENT_REPLY_TO)
        .attach(session)
        .await
        .map_err(|e| management_error(&e))?;

    let request = Message::builder()
        .properties(Properties::builder().reply_to(MANAGEMENT_REPLY_TO).build())
        .application_properties(
            ApplicationProperties::builder()
                .insert("operation", "READ")
                .insert("name", entity_path)
                .insert("type", "com.microsoft:eventhub")
                .build(),
        )
        .value(Value::Null)
        .build();

    let outcome = match sender.send(request).await {
        Ok(_) => receive_partition_ids(&mut receiver).await,
        Err(e) => Err(management_error(&e)),
    };

    let _ = sender.close().await;
    let _ = receiver.close().await;
    outcome
}

async fn receive_partition_ids(receiver: &mut Receiver) -> Result<Vec<String>> {
    let delivery: Delivery<Body<Value>> = receiver
        .recv()
        .await
        .map_err(|e| subscription_error(format!("$management: {}", e)))?;
    let _ = receiver.accept(&delivery).await;
    let message = delivery.message();
    check_management_status(message.application_properties.as_ref())?;
    partition_ids_from(&message.body)
}

/// Rejects `$management` answers whose `status-code` is not 200. Answers without
/// a status are taken at face value.
fn check_management_status(properties: Option<&ApplicationProperties>) -> Result<()> {
    let Some(properties) = properties else {
        return Ok(());
    };
    let lookup = |name: &str| {
        properties
            .0
            .iter()
            .find_map(|(key, value)| (key == name).then_some(value))
    };
    let code = match lookup("status-code") {
        Some(SimpleValue::Int(code)) => i64::from(*code),
        Some(SimpleValue::Long(code)) => *code,
        Some(SimpleValue::UInt(code)) => i64::from(*code),
        Some(SimpleValue::Short(code)) => i64::from(*code),
        Some(SimpleValue::UShort(code)) => i64::from(*code),
        _ => return Ok(()),
    };
    if code == 200 {
        return Ok(());
    }
    let description = match lookup("status-description") {
        Some(SimpleValue::String(text)) => text.as_str(),
        _ => "no description",
    };
    Err(subscription_error(format!("$management answered {}: {}", code, description)))
}

fn partition_ids_from(body: &Body<Value>) -> Result<Vec<String>> {
    let Body::Value(AmqpValue(Value::Map(map))) = body else {
        return Err(subscription_error("$management response is not a map"));
    };
    let ids = map
        .iter()
        .find_map(|(key, value)| match key {
            Value::String(k) if k == "partition_ids" => Some(value),
            _ => None,
        })
        .ok_or_else(|| subscription_error("$management response has no partition_ids"))?;

    let items: Vec<&Value> = match ids {
        Value::Array(array) => array.0.iter().collect(),
        Value::List(list) => list.iter().collect(),
        _ => return Err(subscription_error("partition_ids is not a list")),
    };
    Ok(items
        .into_iter()
        .filter_map(|v| match v {
            Value::String(id) => Some(id.clone()),
            _ => None,
        })
        .collect())
}

/// Builds a [`ReceivedEvent`] from a message's annotations and body. String
/// annotations, the offset among them, become system properties.
fn event_from_parts(annotations: Option<&MessageAnnotations>, body: &Body<Value>) -> ReceivedEvent {
    let mut enqueued_time_utc = None;
    let mut system_properties = HashMap::new();

    if let Some(annotations) = annotations {
        for (key, value) in annotations.0.iter() {
            let OwnedKey::Symbol(symbol) = key else { continue };
            match value {
                Value::Timestamp(ts) if symbol.0 == ENQUEUED_TIME_ANNOTATION => {
                    enqueued_time_utc = DateTime::from_timestamp_millis(ts.milliseconds());
                }
                Value::String(text) => {
                    system_properties.insert(symbol.0.clone(), text.clone());
                }
                _ => {}
            }
        }
    }

    ReceivedEvent {
        body: body_bytes(body),
        enqueued_time_utc,
        system_properties,
    }
}

fn body_bytes(body: &Body<Value>) -> Vec<u8> {
    match body {
        Body::Data(batch) => batch.iter().flat_map(|data| data.0.iter().copied()).collect(),
        Body::Value(AmqpValue(Value::String(text))) => text.clone().into_bytes(),
        Body::Value(AmqpValue(Value::Binary(bytes))) => bytes.to_vec(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fe2o3_amqp::types::messaging::Data;
    use fe2o3_amqp::types::primitives::{Array, Binary, OrderedMap, Timestamp};

    fn event(n: u8) -> Result<ReceivedEvent> {
        Ok(ReceivedEvent {
            body: vec![n],
            ..ReceivedEvent::default()
        })
    }

    fn management_answer(ids: Value) -> Body<Value> {
        let mut map = OrderedMap::new();
        map.insert(Value::String("name".to_string()), Value::String("deviceevents".to_string()));
        map.insert(Value::String("partition_ids".to_string()), ids);
        Body::Value(AmqpValue(Value::Map(map)))
    }

    #[test]
    fn partition_address_layout() {
        assert_eq!(
            partition_address("deviceevents", "$Default", "3"),
            "deviceevents/ConsumerGroups/$Default/Partitions/3"
        );
    }

    #[tokio::test]
    async fn batches_are_capped_and_errors_are_deferred() {
        let (tx, rx) = mpsc::channel(16);
        let mut queue = BatchQueue::new(rx, 2);
        for item in [event(1), event(2), event(3), Err(subscription_error("boom")), event(4)] {
            tx.send(item).await.unwrap();
        }
        drop(tx);

        let bodies = |batch: Vec<ReceivedEvent>| batch.into_iter().map(|e| e.body[0]).collect::<Vec<_>>();
        assert_eq!(bodies(queue.next().await.unwrap().unwrap()), [1, 2]);
        assert_eq!(bodies(queue.next().await.unwrap().unwrap()), [3]);
        assert!(matches!(queue.next().await, Some(Err(RelayError::Subscription(_)))));
        assert_eq!(bodies(queue.next().await.unwrap().unwrap()), [4]);
        assert!(queue.next().await.is_none());
    }

    #[test]
    fn selector_filter_is_described_by_its_name() {
        let filter = selector_filter(&StartPosition::AfterOffset("8192".to_string()));
        assert!(matches!(&filter.descriptor, Descriptor::Name(name) if name.0 == SELECTOR_FILTER));
        assert_eq!(
            filter.value,
            Value::String("amqp.annotation.x-opt-offset > '8192'".to_string())
        );
    }

    #[test]
    fn partition_ids_are_read_from_arrays_and_lists() {
        let as_array = management_answer(Value::Array(Array(vec![
            Value::String("0".to_string()),
            Value::String("1".to_string()),
        ])));
        assert_eq!(partition_ids_from(&as_array).unwrap(), ["0", "1"]);

        let as_list = management_answer(Value::List(vec![
            Value::String("0".to_string()),
            Value::Int(7),
            Value::String("2".to_string()),
        ]));
        assert_eq!(partition_ids_from(&as_list).unwrap(), ["0", "2"]);
    }

    #[test]
    fn management_answers_without_ids_are_rejected() {
        let mut map = OrderedMap::new();
        map.insert(Value::String("name".to_string()), Value::String("deviceevents".to_string()));
        let missing = Body::Value(AmqpValue(Value::Map(map)));
        assert!(partition_ids_from(&missing).unwrap_err().to_string().contains("no partition_ids"));

        let not_a_map = Body::Value(AmqpValue(Value::String("nope".to_string())));
        assert!(partition_ids_from(&not_a_map).is_err());
    }

    #[test]
    fn management_status_other_than_200_is_an_error() {
        let ok = ApplicationProperties::builder().insert("status-code", 200).build();
        assert!(check_management_status(Some(&ok)).is_ok());
        assert!(check_management_status(None).is_ok());

        let denied = ApplicationProperties::builder()
            .insert("status-code", 401)
            .insert("status-description", "Unauthorized")
            .build();
        let err = check_management_status(Some(&denied)).unwrap_err();
        assert!(matches!(err, RelayError::Subscription(_)));
        assert!(err.to_string().contains("401: Unauthorized"));
    }

    #[test]
    fn events_carry_enqueue_time_and_string_annotations() {
        let enqueued = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut map = OrderedMap::new();
        map.insert(
            OwnedKey::Symbol(Symbol::from(ENQUEUED_TIME_ANNOTATION)),
            Value::Timestamp(Timestamp::from_milliseconds(enqueued.timestamp_millis())),
        );
        map.insert(
            OwnedKey::Symbol(Symbol::from("iothub-connection-device-id")),
            Value::String("dev-1".to_string()),
        );
        map.insert(
            OwnedKey::Symbol(Symbol::from("x-opt-offset")),
            Value::String("4096".to_string()),
        );
        map.insert(OwnedKey::Symbol(Symbol::from("x-opt-sequence-number")), Value::Long(12));
        let annotations = MessageAnnotations(map);

        let event = event_from_parts(
            Some(&annotations),
            &Body::Value(AmqpValue(Value::String("42".to_string()))),
        );

        assert_eq!(event.body, b"42");
        assert_eq!(event.enqueued_time_utc, Some(enqueued));
        assert_eq!(event.system_properties["iothub-connection-device-id"], "dev-1");
        assert_eq!(event.system_properties["x-opt-offset"], "4096");
        assert!(!event.system_properties.contains_key("x-opt-sequence-number"));
    }

    #[test]
    fn data_sections_are_concatenated() {
        let body: Body<Value> = Body::Data(
            vec![
                Data(Binary::from(b"{\"t\":".to_vec())),
                Data(Binary::from(b"21.5}".to_vec())),
            ]
            .into(),
        );
        assert_eq!(body_bytes(&body), br#"{"t":21.5}"#);

        let binary = Body::Value(AmqpValue(Value::Binary(Binary::from(vec![0xff, 0x00]))));
        assert_eq!(body_bytes(&binary), [0xff, 0x00]);

        let event = event_from_parts(None, &Body::Value(AmqpValue(Value::Null)));
        assert!(event.body.is_empty());
        assert!(event.enqueued_time_utc.is_none());
    }
}
