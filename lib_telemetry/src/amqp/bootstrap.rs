//! The IoT Hub side of endpoint resolution. The connection is opened, a session
//! begun and a single receiver attached; IoT Hub answers that attach by closing
//! the link with a redirect, which surfaces here as an attach error.

use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::{LinkStateError, ReceiverAttachError, RecvError};
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::Body;
use fe2o3_amqp::types::primitives::Value;
use fe2o3_amqp::{Connection, Receiver, Session};

use crate::amqp::{CONTAINER_ID, link_error_from, transport_failure};
use crate::resolver::transport::{BootstrapConnection, BootstrapOptions, BootstrapTransport, LinkError};

const BOOTSTRAP_LINK_NAME: &str = "endpoint-redirect";

/// Opens bootstrap connections with `fe2o3-amqp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpBootstrapTransport;

impl AmqpBootstrapTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BootstrapTransport for AmqpBootstrapTransport {
    async fn connect(&self, options: BootstrapOptions) -> Result<Box<dyn BootstrapConnection>, LinkError> {
        // Single attempt: `options.reconnect` is always false here and
        // fe2o3-amqp never reconnects on its own.
        let url = format!("amqps://{}:{}", options.host, options.port);
        let mut connection = Connection::builder()
            .container_id(CONTAINER_ID)
            .hostname(options.host.as_str())
            .alt_tls_establishment(true)
            .sasl_profile(SaslProfile::Plain {
                username: options.username,
                password: options.password,
            })
            .open(url.as_str())
            .await
            .map_err(transport_failure)?;

        let session = match Session::begin(&mut connection).await {
            Ok(session) => session,
            Err(e) => {
                let _ = connection.close().await;
                return Err(transport_failure(e));
            }
        };

        Ok(Box::new(AmqpBootstrapConnection {
            connection,
            session,
            receiver: None,
        }))
    }
}

/// A live bootstrap connection.
pub struct AmqpBootstrapConnection {
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
    receiver: Option<Receiver>,
}

#[async_trait]
impl BootstrapConnection for AmqpBootstrapConnection {
    async fn attach_receiver(&mut self, address: &str) -> Result<(), LinkError> {
        match Receiver::attach(&mut self.session, BOOTSTRAP_LINK_NAME, address).await {
            Ok(receiver) => {
                self.receiver = Some(receiver);
                Ok(())
            }
            Err(ReceiverAttachError::RemoteClosedWithError(error)) => Err(link_error_from(error)),
            Err(e) => Err(transport_failure(e)),
        }
    }

    async fn next_link_error(&mut self) -> Option<LinkError> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv::<Body<Value>>().await {
                Ok(delivery) => {
                    // Nothing is expected on the bootstrap link; settle and keep waiting.
                    let _ = receiver.accept(&delivery).await;
                }
                Err(RecvError::LinkStateError(LinkStateError::RemoteDetachedWithError(error)))
                | Err(RecvError::LinkStateError(LinkStateError::RemoteClosedWithError(error))) => {
                    return Some(link_error_from(error));
                }
                Err(e) => {
                    log::debug!("Bootstrap link ended without an error condition: {}", e);
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.close().await;
        }
        let _ = self.session.end().await;
        self.connection.close().await.map_err(transport_failure)
    }
}
