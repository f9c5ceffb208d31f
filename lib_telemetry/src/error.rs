//! # Relay Error Taxonomy
//!
//! Every failure the relay can produce is one of the variants below. Only
//! `InvalidDescriptor` and `RedirectProtocol` abort startup; the remaining
//! variants are logged by the unit of work that produced them and never cross
//! into unrelated work (other clients, later batches).

use thiserror::Error;

use crate::resolver::transport::LinkError;

/// Errors that can occur while converting, consuming or relaying telemetry.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The IoT Hub connection string is missing fields or carries unusable values.
    #[error("Invalid IoT Hub connection string: {0}")]
    InvalidDescriptor(String),

    /// The bootstrap connection did not produce a usable link redirect.
    #[error("Redirect protocol error: {0}")]
    RedirectProtocol(#[from] RedirectError),

    /// A fault reported by the partition subscription.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Pushing a payload to a single client failed.
    #[error("Failed to send to client {client}: {reason}")]
    BroadcastSend {
        /// Identifier of the client that failed.
        client: String,
        /// Transport-level reason.
        reason: String,
    },

    /// Tearing down a connection failed.
    #[error("Close error: {0}")]
    Close(String),
}

/// Reasons the redirect handshake can fail.
#[derive(Debug, Error)]
pub enum RedirectError {
    /// The redirect carried no `hostname` entry.
    #[error("link redirect did not carry a hostname")]
    MissingHostname,

    /// The redirect address did not match `...:5671/<entityPath>/$management`.
    #[error("Cannot parse the EventHub name from the given address: {0}.")]
    UnparsableAddress(String),

    /// The link failed with a condition other than a redirect.
    #[error("link failed: {0}")]
    Link(LinkError),

    /// Opening the bootstrap connection or attaching the receiver failed at the transport level.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No link error arrived before the redirect deadline, or the link ended without one.
    #[error("no link redirect received")]
    Timeout,
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;
