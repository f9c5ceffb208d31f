//! # AMQP Adapters
//!
//! `fe2o3-amqp` implementations of the two transport seams:
//!
//! - [`AmqpBootstrapTransport`] opens the one-shot IoT Hub connection that
//!   yields the link redirect.
//! - [`AmqpConsumerFactory`] opens the Event Hubs-compatible endpoint, lists its
//!   partitions through `$management` and keeps one filtered receiver per
//!   partition alive.
//!
//! Both connect over TLS on port 5671 and authenticate with SASL PLAIN.

/// Bootstrap connection.
pub mod bootstrap;
/// Partition consumer.
pub mod consumer;

use std::collections::HashMap;

use fe2o3_amqp::types::definitions::{self, ErrorCondition};
use fe2o3_amqp::types::primitives::Value;

use crate::resolver::transport::{LINK_REDIRECT, LinkError};

pub use bootstrap::{AmqpBootstrapConnection, AmqpBootstrapTransport};
pub use consumer::{AmqpConsumerFactory, AmqpEventConsumer, DEFAULT_MAX_BATCH_SIZE};

/// Container id announced in every `open` frame.
pub const CONTAINER_ID: &str = "lib-telemetry";

/// Converts a broker error into the transport-neutral [`LinkError`], keeping only
/// string-valued info entries.
pub(crate) fn link_error_from(error: definitions::Error) -> LinkError {
    let condition = match &error.condition {
        ErrorCondition::LinkError(definitions::LinkError::Redirect) => LINK_REDIRECT.to_string(),
        other => condition_symbol(other),
    };
    let mut info = HashMap::new();
    if let Some(fields) = &error.info {
        for (key, value) in fields.iter() {
            if let Value::String(text) = value {
                info.insert(key.0.clone(), text.clone());
            }
        }
    }
    LinkError {
        condition: Some(condition),
        description: error.description,
        info,
    }
}

/// The wire symbol of a condition, such as `amqp:unauthorized-access`.
fn condition_symbol(condition: &ErrorCondition) -> String {
    match serde_amqp::to_value(condition) {
        Ok(Value::Symbol(symbol)) => symbol.0,
        _ => format!("{:?}", condition),
    }
}

/// A [`LinkError`] with no condition, for failures below the link layer.
pub(crate) fn transport_failure(description: impl ToString) -> LinkError {
    LinkError {
        condition: None,
        description: Some(description.to_string()),
        info: HashMap::new(),
    }
}
