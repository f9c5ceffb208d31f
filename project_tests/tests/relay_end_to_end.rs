use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use lib_telemetry::error::RedirectError;
use lib_telemetry::resolver::transport::LinkError;
use lib_telemetry::{
    BroadcastHub, ChannelClient, ConnectionDescriptor, EndpointResolver, Relay, RelayError, ResolverState, StreamReader,
};
use project_tests::{ChannelConsumerFactory, RedirectingTransport, TEST_KEY, device_event, test_connection_string};

const REDIRECT_HOST: &str = "h2.servicebus.windows.net";
const REDIRECT_ADDRESS: &str = "amqps://h2.servicebus.windows.net:5671/deviceevents/$management";

async fn next_payload(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Arc<str>>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no payload within 5s")
        .expect("client channel closed")
        .to_string()
}

#[tokio::test]
async fn telemetry_flows_from_partition_to_open_clients() {
    let transport = RedirectingTransport::redirect(REDIRECT_HOST, REDIRECT_ADDRESS);
    let (factory, batches) = ChannelConsumerFactory::new();
    let hub = Arc::new(BroadcastHub::new());
    let mut relay = Relay::new(
        EndpointResolver::new(transport.clone()),
        StreamReader::new(factory.clone()),
        Arc::clone(&hub),
    );

    let (open, mut open_rx) = ChannelClient::new("browser-1");
    let (closed, closed_rx) = ChannelClient::new("browser-2");
    drop(closed_rx);
    hub.register(Arc::new(open));
    hub.register(Arc::new(closed));

    let descriptor: ConnectionDescriptor = test_connection_string().parse().unwrap();
    let endpoint = relay.start(&descriptor, "$Default").await.unwrap().clone();

    assert_eq!(endpoint.host, REDIRECT_HOST);
    assert_eq!(endpoint.entity_path, "deviceevents");
    assert_eq!(
        endpoint.to_connection_string(),
        format!(
            "Endpoint=sb://{}/;EntityPath=deviceevents;SharedAccessKeyName=service;SharedAccessKey={}",
            REDIRECT_HOST, TEST_KEY
        )
    );
    let (requested, group) = factory.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(requested, endpoint);
    assert_eq!(group, "$Default");
    assert!(relay.is_running());

    let mut stamped = device_event(b"42", Some("dev-1"));
    stamped.enqueued_time_utc = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    batches
        .send(Ok(vec![stamped, device_event(br#"{"t":21.5}"#, None)]))
        .unwrap();

    assert_eq!(
        next_payload(&mut open_rx).await,
        r#"{"IotData":"42","MessageDate":"2024-03-01T12:00:00.000Z","DeviceId":"dev-1"}"#
    );
    let second: serde_json::Value = serde_json::from_str(&next_payload(&mut open_rx).await).unwrap();
    assert_eq!(second["IotData"], r#"{"t":21.5}"#);
    assert!(second.get("DeviceId").is_none());
    assert!(second["MessageDate"].as_str().unwrap().ends_with('Z'));

    // The closed client was skipped and purged.
    assert_eq!(hub.len(), 1);

    relay.stop().await;
    assert!(!relay.is_running());
    assert_eq!(factory.closes.load(Ordering::SeqCst), 1);

    // Stopping again only warns.
    relay.stop().await;
    assert_eq!(factory.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscription_faults_do_not_stop_delivery() {
    let transport = RedirectingTransport::redirect(REDIRECT_HOST, REDIRECT_ADDRESS);
    let (factory, batches) = ChannelConsumerFactory::new();
    let hub = Arc::new(BroadcastHub::new());
    let mut relay = Relay::new(EndpointResolver::new(transport), StreamReader::new(factory), Arc::clone(&hub));

    let (client, mut rx) = ChannelClient::new("browser");
    hub.register(Arc::new(client));

    let descriptor: ConnectionDescriptor = test_connection_string().parse().unwrap();
    relay.start(&descriptor, "$Default").await.unwrap();

    batches
        .send(Err(RelayError::Subscription("partition 2 lost ownership".to_string())))
        .unwrap();
    batches.send(Ok(vec![device_event(b"after", Some("dev-9"))])).unwrap();

    let payload: serde_json::Value = serde_json::from_str(&next_payload(&mut rx).await).unwrap();
    assert_eq!(payload["IotData"], "after");
    assert_eq!(payload["DeviceId"], "dev-9");

    relay.stop().await;
}

#[tokio::test]
async fn invalid_connection_string_never_connects() {
    let transport = RedirectingTransport::redirect(REDIRECT_HOST, REDIRECT_ADDRESS);
    let resolver = EndpointResolver::new(transport.clone());

    let descriptor = ConnectionDescriptor::parse("HostName=h.azure-devices.net;SharedAccessKeyName=service");
    let err = resolver.resolve(&descriptor).await.unwrap_err();

    assert!(matches!(err, RelayError::InvalidDescriptor(_)));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
    assert_eq!(resolver.state(), ResolverState::Failed);
}

#[tokio::test]
async fn redirect_without_entity_path_is_rejected() {
    let transport = RedirectingTransport::redirect(REDIRECT_HOST, "amqps://h2.servicebus.windows.net/deviceevents");
    let resolver = EndpointResolver::new(transport);

    let descriptor: ConnectionDescriptor = test_connection_string().parse().unwrap();
    let err = resolver.resolve(&descriptor).await.unwrap_err();

    match err {
        RelayError::RedirectProtocol(RedirectError::UnparsableAddress(address)) => {
            assert_eq!(address, "amqps://h2.servicebus.windows.net/deviceevents");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn non_redirect_link_errors_fail_resolution() {
    let transport = RedirectingTransport::answering(LinkError::with_condition("amqp:unauthorized-access"));
    let resolver = EndpointResolver::new(transport);

    let descriptor: ConnectionDescriptor = test_connection_string().parse().unwrap();
    let err = resolver.resolve(&descriptor).await.unwrap_err();

    assert!(matches!(err, RelayError::RedirectProtocol(RedirectError::Link(_))));
    assert!(err.to_string().contains("amqp:unauthorized-access"));
}

#[tokio::test]
async fn resolution_failure_keeps_the_reader_idle() {
    let transport = RedirectingTransport::answering(LinkError::with_condition("amqp:not-found"));
    let (factory, _batches) = ChannelConsumerFactory::new();
    let mut relay = Relay::new(
        EndpointResolver::new(transport),
        StreamReader::new(factory.clone()),
        Arc::new(BroadcastHub::new()),
    );

    let descriptor: ConnectionDescriptor = test_connection_string().parse().unwrap();
    assert!(relay.start(&descriptor, "$Default").await.is_err());
    assert!(relay.endpoint().is_none());
    assert!(!relay.is_running());
    assert!(factory.last_request.lock().unwrap().is_none());
}
