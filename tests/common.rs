//! Common test harness utilities for integration tests.
//!
//! Provides mock collaborators (transport sink, authentication provider,
//! bridge, sending clients, feedback channels) with call recording, plus a
//! harness that wires them into a running adapter.

// Not all test files use all helpers; silence dead_code warnings.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use conduit::connection::{AdapterInputs, ConnectionHandle, MessagingChannel, MqttAdapter};
use conduit::protocol::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, Qos, SubscribePacket,
    SubscriptionRequest, UnsubscribePacket, WillMessage,
};
use conduit::{
    AdapterConfig, AdapterMetrics, AuthenticationProvider, ClientCredentials, FeedbackChannel,
    Identity, InMemoryQos2Store, InMemorySessionStore, MessagingBridge, MessagingBridgeFactory,
    PacketSink, SendingClient, SystemClock, UpstreamMessage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

/// Route adapter logs to the test output when `RUST_LOG` asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds; panics after thirty (virtual) seconds. The
/// window leaves room for paused-clock tests to auto-advance across
/// keep-alive horizons.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockSink {
    written: Mutex<Vec<Packet>>,
    pub reads_requested: AtomicUsize,
    pub flushes: AtomicUsize,
    pub closed: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl MockSink {
    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().clone()
    }

    pub fn written_len(&self) -> usize {
        self.written.lock().len()
    }

    pub fn reads(&self) -> usize {
        self.reads_requested.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketSink for MockSink {
    async fn write(&self, packet: Packet) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("write failed");
        }
        self.written.lock().push(packet);
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn request_read(&self) {
        self.reads_requested.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticAuth {
    pub reject: AtomicBool,
    pub fail: AtomicBool,
    /// When armed, `authenticate` waits here before answering; lets tests
    /// park the connection in the CONNECT-processing phase.
    pub gate: Mutex<Option<Arc<Semaphore>>>,
}

impl StaticAuth {
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl AuthenticationProvider for StaticAuth {
    async fn authenticate(&self, credentials: &ClientCredentials) -> anyhow::Result<Identity> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate").forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("authentication backend unavailable");
        }
        if self.reject.load(Ordering::SeqCst) {
            return Ok(Identity::rejected(credentials.client_id.clone()));
        }
        Ok(Identity::authenticated(credentials.client_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Feedback channels
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockFeedback {
    pub completes: AtomicUsize,
    pub abandons: AtomicUsize,
    pub rejects: AtomicUsize,
}

impl MockFeedback {
    pub fn completes(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    pub fn abandons(&self) -> usize {
        self.abandons.load(Ordering::SeqCst)
    }

    pub fn rejects(&self) -> usize {
        self.rejects.load(Ordering::SeqCst)
    }

    pub fn settlements(&self) -> usize {
        self.completes() + self.abandons() + self.rejects()
    }
}

#[async_trait]
impl FeedbackChannel for MockFeedback {
    async fn complete(&self) -> anyhow::Result<()> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abandon(&self) -> anyhow::Result<()> {
        self.abandons.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self) -> anyhow::Result<()> {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sending clients and bridge
// ---------------------------------------------------------------------------

pub struct MockSendingClient {
    id: String,
    max_pending: usize,
    pub sent: Mutex<Vec<UpstreamMessage>>,
    pub fail: AtomicBool,
    permits: Option<Arc<Semaphore>>,
}

impl MockSendingClient {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            max_pending: 16,
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            permits: None,
        })
    }

    /// A client whose sends block until the returned semaphore is released.
    pub fn gated(id: &str, max_pending: usize) -> (Arc<Self>, Arc<Semaphore>) {
        let permits = Arc::new(Semaphore::new(0));
        let client = Arc::new(Self {
            id: id.to_string(),
            max_pending,
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            permits: Some(permits.clone()),
        });
        (client, permits)
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl SendingClient for MockSendingClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_message(&self, topic: &str, payload: Bytes) -> UpstreamMessage {
        UpstreamMessage::new(topic, payload)
    }

    async fn send(&self, message: UpstreamMessage) -> anyhow::Result<()> {
        if let Some(permits) = &self.permits {
            permits.acquire().await.expect("permits").forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("upstream send failed");
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn max_pending_messages(&self) -> usize {
        self.max_pending
    }
}

#[derive(Default)]
pub struct MockBridge {
    routes: Mutex<HashMap<String, Arc<MockSendingClient>>>,
    default_client: Mutex<Option<Arc<MockSendingClient>>>,
    bound: Mutex<Option<MessagingChannel>>,
    pub disposed: Mutex<Option<Option<String>>>,
    pub capability_changes: AtomicUsize,
}

impl MockBridge {
    /// Route every topic to one client.
    pub fn route_all(&self, client: Arc<MockSendingClient>) {
        *self.default_client.lock() = Some(client);
    }

    /// Route one exact topic to a client.
    pub fn route(&self, topic: &str, client: Arc<MockSendingClient>) {
        self.routes.lock().insert(topic.to_string(), client);
    }

    pub fn channel(&self) -> MessagingChannel {
        self.bound.lock().clone().expect("messaging channel bound")
    }

    pub fn is_bound(&self) -> bool {
        self.bound.lock().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.lock().is_some()
    }

    pub fn dispose_cause(&self) -> Option<String> {
        self.disposed.lock().clone().flatten()
    }
}

#[async_trait]
impl MessagingBridge for MockBridge {
    async fn bind_messaging_channel(&self, channel: MessagingChannel) -> anyhow::Result<()> {
        *self.bound.lock() = Some(channel);
        Ok(())
    }

    fn try_resolve_client(&self, topic: &str) -> Option<Arc<dyn SendingClient>> {
        if let Some(client) = self.routes.lock().get(topic) {
            return Some(client.clone());
        }
        self.default_client
            .lock()
            .clone()
            .map(|client| client as Arc<dyn SendingClient>)
    }

    fn notify_capabilities_changed(&self) {
        self.capability_changes.fetch_add(1, Ordering::SeqCst);
    }

    async fn dispose(&self, cause: Option<String>) -> anyhow::Result<()> {
        *self.disposed.lock() = Some(cause);
        Ok(())
    }
}

pub struct MockBridgeFactory {
    pub bridge: Arc<MockBridge>,
    pub fail: AtomicBool,
}

#[async_trait]
impl MessagingBridgeFactory for MockBridgeFactory {
    async fn open(&self, _identity: &Identity) -> anyhow::Result<Arc<dyn MessagingBridge>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("bridge unavailable");
        }
        Ok(self.bridge.clone() as Arc<dyn MessagingBridge>)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub handle: ConnectionHandle,
    pub sink: Arc<MockSink>,
    pub auth: Arc<StaticAuth>,
    pub bridge: Arc<MockBridge>,
    pub bridge_factory: Arc<MockBridgeFactory>,
    pub sessions: Arc<InMemorySessionStore>,
    pub qos2: Arc<InMemoryQos2Store>,
    pub metrics: Arc<AdapterMetrics>,
}

impl Harness {
    pub fn start(config: AdapterConfig) -> Self {
        Self::start_with_stores(
            config,
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryQos2Store::new()),
        )
    }

    pub fn start_with_stores(
        config: AdapterConfig,
        sessions: Arc<InMemorySessionStore>,
        qos2: Arc<InMemoryQos2Store>,
    ) -> Self {
        init_tracing();
        let sink = Arc::new(MockSink::default());
        let auth = Arc::new(StaticAuth::default());
        let bridge = Arc::new(MockBridge::default());
        let bridge_factory = Arc::new(MockBridgeFactory {
            bridge: bridge.clone(),
            fail: AtomicBool::new(false),
        });
        let metrics = Arc::new(AdapterMetrics::default());

        let (adapter, handle) = MqttAdapter::new(
            config,
            SystemClock,
            AdapterInputs {
                sink: sink.clone(),
                auth: auth.clone(),
                bridge_factory: bridge_factory.clone(),
                session_store: sessions.clone(),
                qos2_store: qos2.clone(),
                metrics: metrics.clone(),
                remote_addr: None,
            },
        );
        tokio::spawn(adapter.run());

        Self {
            handle,
            sink,
            auth,
            bridge,
            bridge_factory,
            sessions,
            qos2,
            metrics,
        }
    }

    /// Send CONNECT and wait for CONNACK `Accepted`.
    pub async fn connect(&self, client_id: &str, clean_session: bool, keep_alive_secs: u16) {
        self.handle
            .packet_received(Packet::Connect(connect_packet(
                client_id,
                clean_session,
                keep_alive_secs,
                None,
            )));
        let sink = self.sink.clone();
        wait_until(move || sink.written_len() >= 1).await;
        match &self.sink.written()[0] {
            Packet::ConnAck(ConnAckPacket {
                return_code: ConnectReturnCode::Accepted,
                ..
            }) => {}
            other => panic!("expected CONNACK Accepted, got {other:?}"),
        }
        let bridge = self.bridge.clone();
        wait_until(move || bridge.is_bound()).await;
    }

    /// Deliver an upstream message and return its feedback recorder.
    pub fn deliver(&self, message: UpstreamMessage) -> Arc<MockFeedback> {
        let feedback = Arc::new(MockFeedback::default());
        assert!(self.bridge.channel().deliver(message, feedback.clone()));
        feedback
    }

    /// Deliver with a pre-built feedback recorder.
    pub fn deliver_with(&self, message: UpstreamMessage, feedback: Arc<MockFeedback>) {
        assert!(self.bridge.channel().deliver(message, feedback));
    }

    pub async fn wait_written(&self, count: usize) -> Vec<Packet> {
        let sink = self.sink.clone();
        wait_until(move || sink.written_len() >= count).await;
        self.sink.written()
    }

    pub async fn wait_closed(&self) {
        let sink = self.sink.clone();
        wait_until(move || sink.is_closed()).await;
    }
}

// ---------------------------------------------------------------------------
// Packet builders
// ---------------------------------------------------------------------------

pub fn connect_packet(
    client_id: &str,
    clean_session: bool,
    keep_alive_secs: u16,
    will: Option<WillMessage>,
) -> ConnectPacket {
    ConnectPacket {
        client_id: client_id.to_string(),
        keep_alive_secs,
        clean_session,
        will,
        username: None,
        password: None,
    }
}

pub fn subscribe_packet(packet_id: u16, filters: &[(&str, Qos)]) -> Packet {
    Packet::Subscribe(SubscribePacket {
        packet_id,
        requests: filters
            .iter()
            .map(|(filter, qos)| SubscriptionRequest {
                topic_filter: (*filter).to_string(),
                qos: *qos,
            })
            .collect(),
    })
}

pub fn unsubscribe_packet(packet_id: u16, filters: &[&str]) -> Packet {
    Packet::Unsubscribe(UnsubscribePacket {
        packet_id,
        topic_filters: filters.iter().map(|f| (*f).to_string()).collect(),
    })
}

pub fn publish_packet(topic: &str, payload: &str, qos: Qos, packet_id: Option<u16>) -> Packet {
    Packet::Publish(PublishPacket {
        topic: topic.to_string(),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
        qos,
        packet_id,
        dup: false,
        retain: false,
    })
}

/// An upstream message stamped ahead of any subscription created during the
/// test, so the subscription time gate passes.
pub fn upstream_message(topic: &str, payload: &str, qos: u8, sequence: u64) -> UpstreamMessage {
    let mut message = UpstreamMessage::new(topic, Bytes::copy_from_slice(payload.as_bytes()));
    message.qos = qos;
    message.sequence_number = sequence;
    message.created_at = SystemTime::now() + Duration::from_secs(60);
    message
}

/// Find the PUBLISH packets among everything written.
pub fn published(packets: &[Packet]) -> Vec<PublishPacket> {
    packets
        .iter()
        .filter_map(|packet| match packet {
            Packet::Publish(publish) => Some(publish.clone()),
            _ => None,
        })
        .collect()
}
