//! # Connection Module
//!
//! Management-plane descriptors, the data-plane endpoint they resolve to, and
//! the grammar used to read the Event Hub name out of a link redirect.

/// IoT Hub connection strings and resolved Event Hubs endpoints.
pub mod descriptor;
/// Entity path extraction from redirect addresses.
pub mod redirect;

pub use descriptor::{ConnectionDescriptor, StreamEndpoint};
pub use redirect::parse_entity_path;
