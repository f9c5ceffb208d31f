use crate::telemetry_logic::config::Config;
use anyhow::Result;
use lib_telemetry::ingestors::ConsumerFactory;
use lib_telemetry::resolver::transport::BootstrapTransport;
use lib_telemetry::{BroadcastHub, EndpointResolver, Relay, StreamReader};
use std::sync::Arc;

/// Assembles a relay over the given transports.
#[cfg_attr(not(feature = "amqp"), allow(dead_code))]
pub fn relay_with(
    config: &Config,
    transport: Arc<dyn BootstrapTransport>,
    factory: Arc<dyn ConsumerFactory>,
    hub: Arc<BroadcastHub>,
) -> Relay {
    let resolver = EndpointResolver::new(transport).with_redirect_timeout(config.redirect_timeout());
    Relay::new(resolver, StreamReader::new(factory), hub)
}

/// Builds the relay with the AMQP transport compiled into this binary.
#[cfg(feature = "amqp")]
pub fn build_relay(config: &Config, hub: Arc<BroadcastHub>) -> Result<Relay> {
    use lib_telemetry::amqp::{AmqpBootstrapTransport, AmqpConsumerFactory};

    Ok(relay_with(
        config,
        Arc::new(AmqpBootstrapTransport::new()),
        Arc::new(AmqpConsumerFactory::new(config.max_batch_size())),
        hub,
    ))
}

#[cfg(not(feature = "amqp"))]
pub fn build_relay(_config: &Config, _hub: Arc<BroadcastHub>) -> Result<Relay> {
    anyhow::bail!("No AMQP transport compiled into this binary. Rebuild with `--features amqp`.")
}
