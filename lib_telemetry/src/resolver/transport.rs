//! # Bootstrap Transport Seam
//!
//! The resolver only needs three things from an AMQP stack: open a TLS
//! connection authenticated with SASL PLAIN, attach a receiving link, and
//! observe the first error on that link. Concrete stacks implement these traits.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

/// Broker condition signalling that the client addressed the wrong node.
pub const LINK_REDIRECT: &str = "amqp:link:redirect";

/// AMQPS port used by IoT Hub.
pub const AMQPS_PORT: u16 = 5671;

/// Parameters for the one-shot bootstrap connection.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    /// Host to connect to (also the TLS server name).
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// SASL PLAIN username, `<keyName>@sas.root.<hubName>`.
    pub username: String,
    /// SASL PLAIN password, a freshly minted SAS token.
    pub password: String,
    /// Whether the transport may re-establish a dropped connection.
    pub reconnect: bool,
}

impl fmt::Debug for BootstrapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// An error raised on an AMQP link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkError {
    /// Error condition symbol, e.g. `amqp:link:redirect`.
    pub condition: Option<String>,
    /// Free-text description from the broker.
    pub description: Option<String>,
    /// String-valued entries of the error's info map.
    pub info: HashMap<String, String>,
}

impl LinkError {
    /// Builds an error with only a condition.
    pub fn with_condition(condition: impl Into<String>) -> Self {
        Self {
            condition: Some(condition.into()),
            ..Self::default()
        }
    }

    /// Builds a link redirect carrying `hostname` and `address`.
    pub fn redirect(hostname: impl Into<String>, address: impl Into<String>) -> Self {
        let mut info = HashMap::new();
        info.insert("hostname".to_string(), hostname.into());
        info.insert("address".to_string(), address.into());
        Self {
            condition: Some(LINK_REDIRECT.to_string()),
            description: None,
            info,
        }
    }

    /// Whether this is the broker's link-redirect condition.
    pub fn is_redirect(&self) -> bool {
        self.condition.as_deref() == Some(LINK_REDIRECT)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let condition = self.condition.as_deref().unwrap_or("<no condition>");
        match &self.description {
            Some(description) => write!(f, "{}: {}", condition, description),
            None => write!(f, "{}", condition),
        }
    }
}

/// Opens bootstrap connections.
#[async_trait]
pub trait BootstrapTransport: Send + Sync {
    /// Opens a secured connection.
    async fn connect(&self, options: BootstrapOptions) -> Result<Box<dyn BootstrapConnection>, LinkError>;
}

/// An open bootstrap connection.
#[async_trait]
pub trait BootstrapConnection: Send {
    /// Attaches a receiving link on `address`. A rejection delivered as part of
    /// the attach exchange is returned as `Err`.
    async fn attach_receiver(&mut self, address: &str) -> Result<(), LinkError>;

    /// Waits for the first error on the attached link. `None` means the link or
    /// connection ended without one.
    async fn next_link_error(&mut self) -> Option<LinkError>;

    /// Closes the connection.
    async fn close(&mut self) -> Result<(), LinkError>;
}
