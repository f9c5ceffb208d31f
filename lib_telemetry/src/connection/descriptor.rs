//! # Connection Descriptors
//!
//! The management-plane IoT Hub connection string and the data-plane Event Hubs
//! endpoint it resolves to.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose};

use crate::error::{RelayError, Result};

/// A parsed `HostName=...;SharedAccessKeyName=...;SharedAccessKey=...` string.
///
/// Parsing is lenient: unknown keys are ignored and missing keys stay empty so
/// that [`ConnectionDescriptor::validate`] can report them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// IoT Hub host, e.g. `my-hub.azure-devices.net`.
    pub host_name: String,
    /// Shared access policy name.
    pub key_name: String,
    /// Base64 shared access key.
    pub key: String,
}

impl ConnectionDescriptor {
    /// Parses a connection string without validating it.
    pub fn parse(connection_string: &str) -> Self {
        let mut descriptor = Self::default();
        for part in connection_string.split(';') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match name.trim() {
                "HostName" => descriptor.host_name = value,
                "SharedAccessKeyName" => descriptor.key_name = value,
                "SharedAccessKey" => descriptor.key = value,
                _ => {}
            }
        }
        descriptor
    }

    /// Checks that all three fields are present and the key decodes.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.host_name.is_empty() {
            missing.push("HostName");
        }
        if self.key_name.is_empty() {
            missing.push("SharedAccessKeyName");
        }
        if self.key.is_empty() {
            missing.push("SharedAccessKey");
        }
        if !missing.is_empty() {
            return Err(RelayError::InvalidDescriptor(format!("missing {}", missing.join(", "))));
        }
        if general_purpose::STANDARD.decode(&self.key).is_err() {
            return Err(RelayError::InvalidDescriptor("SharedAccessKey is not valid base64".to_string()));
        }
        Ok(())
    }

    /// The hub name: the part of the host name before its first `.`.
    pub fn short_name(&self) -> Result<&str> {
        match self.host_name.split_once('.') {
            Some((name, _)) if !name.is_empty() => Ok(name),
            _ => Err(RelayError::InvalidDescriptor(format!(
                "Unable to extract the IotHub name from host name '{}'",
                self.host_name
            ))),
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = RelayError;

    /// Parses and validates in one step.
    fn from_str(s: &str) -> Result<Self> {
        let descriptor = Self::parse(s);
        descriptor.validate()?;
        descriptor.short_name()?;
        Ok(descriptor)
    }
}

// Keys never reach the logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host_name", &self.host_name)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostName={};SharedAccessKeyName={};SharedAccessKey=<redacted>",
            self.host_name, self.key_name
        )
    }
}

/// The resolved Event Hubs-compatible endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    /// Data-plane broker host.
    pub host: String,
    /// Event Hub name.
    pub entity_path: String,
    /// Shared access policy name, carried over from the descriptor.
    pub key_name: String,
    /// Base64 shared access key, carried over from the descriptor.
    pub key: String,
}

impl StreamEndpoint {
    /// Renders `Endpoint=sb://<host>/;EntityPath=<path>;SharedAccessKeyName=<name>;SharedAccessKey=<key>`.
    pub fn to_connection_string(&self) -> String {
        format!(
            "Endpoint=sb://{}/;EntityPath={};SharedAccessKeyName={};SharedAccessKey={}",
            self.host, self.entity_path, self.key_name, self.key
        )
    }
}

impl fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("host", &self.host)
            .field("entity_path", &self.entity_path)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Endpoint=sb://{}/;EntityPath={};SharedAccessKeyName={};SharedAccessKey=<redacted>",
            self.host, self.entity_path, self.key_name
        )
    }
}
