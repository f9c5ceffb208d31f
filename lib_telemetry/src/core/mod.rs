//! # Core Relay Module
//!
//! The fan-out half of the relay and the composition root that feeds it.
//!
//! ## Core Components:
//!
//! - **`client`**: the [`ClientConnection`] seam and the channel-backed client
//!   used for WebSocket sessions.
//! - **`dispatcher`**: the [`BroadcastHub`], a registry of clients with an
//!   isolated, zero-copy fan-out.
//! - **`payload`**: the JSON message shape pushed to browsers.
//! - **`relay`**: resolution, subscription and broadcast wired together.

/// Client connection trait and the channel-backed implementation.
pub mod client;
/// Client registry and fan-out.
pub mod dispatcher;
/// Outbound JSON payload.
pub mod payload;
/// Composition root.
pub mod relay;

// --- Public API Re-exports ---
pub use client::{ChannelClient, ClientConnection};
pub use dispatcher::{BroadcastHub, BroadcastReport};
pub use payload::OutboundPayload;
pub use relay::{Relay, relay_event};
