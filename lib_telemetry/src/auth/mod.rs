//! # Authentication Module
//!
//! Shared Access Signature token minting for IoT Hub and Event Hubs.

/// HMAC-SHA256 signed access tokens.
pub mod sas_token;

pub use sas_token::{SasToken, encode_uri_component};
