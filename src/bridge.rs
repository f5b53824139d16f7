//! Upstream messaging collaborators.
//!
//! The bridge is opened once per authenticated identity and mediates both
//! directions: it resolves per-topic sending clients for device-to-service
//! publishes, and it delivers service-to-device messages through the
//! messaging channel the adapter hands it at bind time. Every delivered
//! message carries its own feedback channel, settled exactly once with
//! `complete`, `abandon`, or `reject`.

use crate::auth::Identity;
use crate::connection::MessagingChannel;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// A message crossing the bridge, in either direction.
///
/// `qos` is the raw wire-level value as carried by the upstream system; the
/// adapter validates it on delivery so an out-of-range level surfaces as a
/// connection error rather than a panic.
#[derive(Debug, Clone)]
pub struct UpstreamMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub sequence_number: u64,
    pub created_at: SystemTime,
    pub delivery_count: u32,
    pub properties: HashMap<String, String>,
}

impl UpstreamMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos: 1,
            sequence_number: 0,
            created_at: SystemTime::now(),
            delivery_count: 0,
            properties: HashMap::new(),
        }
    }
}

/// One service-to-device delivery: the message plus its feedback handle.
pub struct UpstreamDelivery {
    pub message: UpstreamMessage,
    pub feedback: Arc<dyn FeedbackChannel>,
}

/// Per-delivery settlement handle.
#[async_trait]
pub trait FeedbackChannel: Send + Sync {
    /// Acknowledge: the message reached the device at its QoS contract.
    async fn complete(&self) -> anyhow::Result<()>;

    /// Return for redelivery, e.g. on connection loss before the ack.
    async fn abandon(&self) -> anyhow::Result<()>;

    /// Dead-letter: the message can never be delivered on this session.
    async fn reject(&self) -> anyhow::Result<()>;
}

/// Per-topic upstream client for device-to-service publishes.
#[async_trait]
pub trait SendingClient: Send + Sync {
    /// Stable identity for this client; the adapter keys its per-client
    /// FIFO processors on it, so equal routes must yield equal ids.
    fn id(&self) -> &str;

    fn create_message(&self, topic: &str, payload: Bytes) -> UpstreamMessage;

    async fn send(&self, message: UpstreamMessage) -> anyhow::Result<()>;

    /// Backlog bound for this client; inbound reads throttle once reached.
    fn max_pending_messages(&self) -> usize;
}

/// The per-identity messaging bridge.
#[async_trait]
pub trait MessagingBridge: Send + Sync {
    /// Hand the bridge its one-way channel back into the adapter and begin
    /// upstream delivery. Called exactly once, after CONNACK is sent.
    async fn bind_messaging_channel(&self, channel: MessagingChannel) -> anyhow::Result<()>;

    /// Resolve the sending client responsible for a topic name.
    fn try_resolve_client(&self, topic: &str) -> Option<Arc<dyn SendingClient>>;

    /// Subscription set changed; upstream filtering may need a refresh.
    fn notify_capabilities_changed(&self) {}

    /// Tear the bridge down. `cause` is `None` for a graceful close.
    async fn dispose(&self, cause: Option<String>) -> anyhow::Result<()>;
}

/// Opens a bridge for an authenticated identity during CONNECT processing.
#[async_trait]
pub trait MessagingBridgeFactory: Send + Sync {
    async fn open(&self, identity: &Identity) -> anyhow::Result<Arc<dyn MessagingBridge>>;
}
