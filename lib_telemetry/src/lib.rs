//! # lib_telemetry
//!
//! Relays IoT Hub device telemetry to browser clients. An IoT Hub connection
//! string is converted into its Event Hubs-compatible endpoint through a
//! deliberate AMQP link redirect, every partition of that endpoint is read under
//! one consumer group, and each event is pushed as JSON to all open clients.
//!
//! The AMQP and WebSocket stacks stay behind traits
//! ([`crate::resolver::transport::BootstrapTransport`], [`crate::ingestors::ConsumerFactory`],
//! [`crate::core::ClientConnection`]). The `amqp` feature provides `fe2o3-amqp`
//! implementations of the first two.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod auth;
pub mod connection;
pub mod core;
pub mod error;
pub mod ingestors;
pub mod resolver;

#[cfg(feature = "amqp")]
pub mod amqp;

// Re-export the types most callers need.
pub use crate::connection::{ConnectionDescriptor, StreamEndpoint};
pub use crate::core::{BroadcastHub, ChannelClient, ClientConnection, OutboundPayload, Relay};
pub use crate::error::{RedirectError, RelayError};
pub use crate::ingestors::{PartitionEvent, StreamReader};
pub use crate::resolver::{EndpointResolver, ResolverState};
