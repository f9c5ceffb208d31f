//! # Endpoint Resolver
//!
//! Converts an IoT Hub connection string into the Event Hubs-compatible endpoint
//! behind it. IoT Hub does not publish that endpoint directly; instead, attaching
//! a receiver to `amqps://<host>/messages/events/$management` is always rejected
//! with an `amqp:link:redirect` whose info map names the real broker host and,
//! inside its address, the Event Hub name. The rejection is the success signal.
//!
//! ## States
//!
//! ```text
//! INIT -> PARSED -> CONNECTING -> AWAITING_REDIRECT -> RESOLVED
//!   \________\___________\_______________\___________> FAILED
//! ```
//!
//! Only the first link error observed after the attach decides the outcome; the
//! connection is closed right after, so later events are never read.

/// Transport traits the resolver drives.
pub mod transport;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::SasToken;
use crate::connection::{ConnectionDescriptor, StreamEndpoint, parse_entity_path};
use crate::error::{RedirectError, RelayError, Result};
use transport::{AMQPS_PORT, BootstrapConnection, BootstrapOptions, BootstrapTransport, LinkError};

/// Lifetime of the bootstrap SAS token.
pub const TOKEN_TTL_MINUTES: u32 = 5;

/// Default bound on the wait for the redirect.
pub const DEFAULT_REDIRECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on closing the bootstrap connection. Expiry is logged and the
/// close abandoned.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// Nothing attempted yet.
    Init,
    /// The descriptor passed validation.
    Parsed,
    /// Opening the bootstrap connection.
    Connecting,
    /// Receiver attach sent; waiting for the redirect.
    AwaitingRedirect,
    /// An endpoint was produced.
    Resolved,
    /// The attempt failed.
    Failed,
}

impl ResolverState {
    /// Whether no further transitions can happen in this attempt.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }
}

/// Drives the redirect handshake over a [`BootstrapTransport`].
pub struct EndpointResolver {
    transport: Arc<dyn BootstrapTransport>,
    redirect_timeout: Duration,
    close_timeout: Duration,
    state: Mutex<ResolverState>,
}

impl EndpointResolver {
    /// Creates a resolver with the default redirect timeout.
    pub fn new(transport: Arc<dyn BootstrapTransport>) -> Self {
        Self {
            transport,
            redirect_timeout: DEFAULT_REDIRECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            state: Mutex::new(ResolverState::Init),
        }
    }

    /// Overrides how long to wait for the redirect once the receiver is attached.
    pub fn with_redirect_timeout(mut self, timeout: Duration) -> Self {
        self.redirect_timeout = timeout;
        self
    }

    /// Overrides how long closing the bootstrap connection may take.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// State reached by the most recent attempt.
    pub fn state(&self) -> ResolverState {
        *self.state.lock().expect("Resolver state lock poisoned")
    }

    /// Runs one full resolution attempt with a freshly minted token.
    ///
    /// # Errors
    /// - [`RelayError::InvalidDescriptor`] before any connection is attempted.
    /// - [`RelayError::RedirectProtocol`] for every failure after that.
    pub async fn resolve(&self, descriptor: &ConnectionDescriptor) -> Result<StreamEndpoint> {
        self.transition(ResolverState::Init);
        let outcome = self.run(descriptor).await;
        match &outcome {
            Ok(endpoint) => {
                self.transition(ResolverState::Resolved);
                log::info!("Resolved Event Hubs-compatible endpoint: {}", endpoint);
            }
            Err(e) => {
                self.transition(ResolverState::Failed);
                log::error!("Endpoint resolution failed: {}", e);
            }
        }
        outcome
    }

    async fn run(&self, descriptor: &ConnectionDescriptor) -> Result<StreamEndpoint> {
        descriptor.validate()?;
        let hub_name = descriptor.short_name()?;
        self.transition(ResolverState::Parsed);

        let token = SasToken::sign(
            &format!("{}/messages/events", descriptor.host_name),
            &descriptor.key,
            &descriptor.key_name,
            TOKEN_TTL_MINUTES,
        )?;
        let options = BootstrapOptions {
            host: descriptor.host_name.clone(),
            port: AMQPS_PORT,
            username: format!("{}@sas.root.{}", descriptor.key_name, hub_name),
            password: token.to_string(),
            reconnect: false,
        };

        self.transition(ResolverState::Connecting);
        log::debug!("Opening bootstrap connection to {}:{}", options.host, options.port);
        let mut connection = self
            .transport
            .connect(options)
            .await
            .map_err(|e| RedirectError::Transport(e.to_string()))?;

        self.transition(ResolverState::AwaitingRedirect);
        let address = format!("amqps://{}/messages/events/$management", descriptor.host_name);
        let outcome = self.await_redirect(connection.as_mut(), &address).await;

        match tokio::time::timeout(self.close_timeout, connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Ignoring failure to close the bootstrap connection: {}", e),
            Err(_) => log::warn!(
                "Bootstrap connection did not close within {:?}; abandoning it.",
                self.close_timeout
            ),
        }

        endpoint_from_redirect(outcome?, descriptor)
    }

    async fn await_redirect(
        &self,
        connection: &mut dyn BootstrapConnection,
        address: &str,
    ) -> std::result::Result<LinkError, RedirectError> {
        if let Err(rejection) = connection.attach_receiver(address).await {
            return Ok(rejection);
        }
        match tokio::time::timeout(self.redirect_timeout, connection.next_link_error()).await {
            Ok(Some(link_error)) => Ok(link_error),
            Ok(None) => Err(RedirectError::Timeout),
            Err(_) => {
                log::warn!("No link redirect within {:?}", self.redirect_timeout);
                Err(RedirectError::Timeout)
            }
        }
    }

    fn transition(&self, next: ResolverState) {
        let mut state = self.state.lock().expect("Resolver state lock poisoned");
        if state.is_terminal() && next != ResolverState::Init {
            log::debug!("Ignoring resolver transition {:?} -> {:?} after terminal state", *state, next);
            return;
        }
        log::trace!("Resolver state {:?} -> {:?}", *state, next);
        *state = next;
    }
}

/// Turns the first link error of the bootstrap connection into an endpoint.
///
/// # Errors
/// [`RelayError::RedirectProtocol`] when the error is not a redirect, carries no
/// `hostname`, or its `address` does not name an entity path.
pub fn endpoint_from_redirect(link_error: LinkError, descriptor: &ConnectionDescriptor) -> Result<StreamEndpoint> {
    if !link_error.is_redirect() {
        return Err(RedirectError::Link(link_error).into());
    }
    let host = match link_error.info.get("hostname") {
        Some(host) if !host.is_empty() => host.clone(),
        _ => return Err(RedirectError::MissingHostname.into()),
    };
    let address = link_error.info.get("address").cloned().unwrap_or_default();
    let entity_path = parse_entity_path(&address)
        .ok_or_else(|| RelayError::from(RedirectError::UnparsableAddress(address.clone())))?
        .to_string();

    Ok(StreamEndpoint {
        host,
        entity_path,
        key_name: descriptor.key_name.clone(),
        key: descriptor.key.clone(),
    })
}
