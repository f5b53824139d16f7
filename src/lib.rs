#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: protocol handlers are inherently branchy
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

//! Conduit - per-connection MQTT 3.1.1 adapter for an upstream messaging
//! service.
//!
//! One adapter instance owns one client connection: CONNECT authentication,
//! subscription management with persisted session state, bi-directional
//! PUBLISH across all three QoS levels, retransmission, read throttling,
//! keep-alive enforcement, and orderly shutdown with last-will delivery.
//! Everything below the packet layer (sockets, TLS, codec) and everything
//! above the bridge (the actual messaging service) is a collaborator
//! consumed through traits.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - adapter configuration and derived timeouts
//! - `core::time` - deterministic time utilities
//!
//! ## Protocol surface
//! - `protocol` - decoded MQTT 3.1.1 control-packet model
//! - `transport` - packet sink consumed by the adapter
//!
//! ## Collaborators
//! - `auth` - authentication provider
//! - `session` - session state, store, and subscription matching
//! - `qos2` - persisted QoS 2 delivery state
//! - `bridge` - upstream bridge, sending clients, feedback channels
//!
//! ## Connection
//! - `connection` - the per-connection event loop and its processors
//!
//! ## Operations
//! - `metrics` - counters shared across connections
//! - `error` - the adapter error taxonomy

pub mod auth;
pub mod bridge;
pub mod connection;
pub mod core;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod qos2;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use crate::core::{config::AdapterConfig, time::Clock, time::SystemClock};
pub use auth::{AuthenticationProvider, ClientCredentials, Identity};
pub use bridge::{
    FeedbackChannel, MessagingBridge, MessagingBridgeFactory, SendingClient, UpstreamMessage,
};
pub use connection::{AdapterInputs, ConnectionHandle, MessagingChannel, MqttAdapter};
pub use error::AdapterError;
pub use metrics::AdapterMetrics;
pub use protocol::{Packet, Qos};
pub use qos2::{DeliveryState, InMemoryQos2Store, Qos2StateStore};
pub use session::{InMemorySessionStore, SessionState, SessionStateStore, Subscription};
pub use transport::PacketSink;
