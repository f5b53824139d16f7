//! The per-connection adapter.
//!
//! One `MqttAdapter` owns one client connection end to end. It runs as a
//! single task driven by an event channel; packets, upstream deliveries,
//! collaborator completions, and timer fires are all events, so every piece
//! of per-connection state is mutated from exactly one place and needs no
//! locks. Collaborator calls that suspend (store writes, upstream sends,
//! CONNECT establishment) either run inline within one event or run as
//! spawned sub-tasks whose completions come back through the same channel;
//! handlers re-check `Closed` after every suspension before touching the
//! channel or the bridge.

mod ack;
mod inbound;
mod state;

pub use state::{ConnectionFlags, ConnectionState, Phase};

use crate::auth::{AuthenticationProvider, ClientCredentials, Identity};
use crate::bridge::{
    FeedbackChannel, MessagingBridge, MessagingBridgeFactory, UpstreamDelivery, UpstreamMessage,
};
use crate::core::config::AdapterConfig;
use crate::core::time::Clock;
use crate::error::AdapterError;
use crate::metrics::AdapterMetrics;
use crate::protocol::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, Qos, SubAckPacket,
    UnsubAckPacket, WillMessage,
};
use crate::qos2::Qos2StateStore;
use crate::session::{topics, SessionState, SessionStateStore};
use crate::transport::PacketSink;
use ack::{AckProcessor, PendingAck};
use inbound::{build_upstream_message, InboundProcessor};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events driving the connection task.
pub(crate) enum Event {
    /// Decoded packet delivered by the transport.
    Packet(Packet),
    /// Transport-level failure.
    TransportError(anyhow::Error),
    /// The transport saw the channel close.
    ChannelClosed,
    /// Service-to-device message from the bridge.
    Upstream(UpstreamDelivery),
    /// The bridge's receive side failed.
    UpstreamError(anyhow::Error),
    /// CONNECT establishment finished.
    ConnectOutcome(Box<ConnectOutcome>),
    /// A subscription-change batch finished persisting.
    SubscriptionsPersisted {
        state: SessionState,
        acks: Vec<Packet>,
        result: anyhow::Result<()>,
    },
    /// An inbound publish finished its upstream send.
    InboundSettled {
        key: String,
        qos: Qos,
        packet_id: Option<u16>,
        result: anyhow::Result<()>,
    },
    /// External request for a graceful close.
    Shutdown,
}

/// Result of the spawned CONNECT establishment.
pub(crate) enum ConnectOutcome {
    Established {
        identity: Identity,
        bridge: Arc<dyn MessagingBridge>,
        session: SessionState,
        session_present: bool,
    },
    NotAuthorized {
        client_id: String,
    },
    Failed(AdapterError),
}

/// Handle the transport driver uses to feed the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl ConnectionHandle {
    /// Deliver one decoded packet; false once the connection is gone.
    pub fn packet_received(&self, packet: Packet) -> bool {
        self.tx.send(Event::Packet(packet)).is_ok()
    }

    pub fn transport_error(&self, error: anyhow::Error) {
        let _ = self.tx.send(Event::TransportError(error));
    }

    pub fn channel_closed(&self) {
        let _ = self.tx.send(Event::ChannelClosed);
    }

    /// Ask for a graceful close, e.g. on process shutdown.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// One-way channel the adapter hands the bridge at bind time; the bridge
/// holds no other reference back into the connection.
#[derive(Clone)]
pub struct MessagingChannel {
    tx: mpsc::UnboundedSender<Event>,
}

impl MessagingChannel {
    /// Deliver one upstream message; false once the connection is gone.
    pub fn deliver(&self, message: UpstreamMessage, feedback: Arc<dyn FeedbackChannel>) -> bool {
        self.tx
            .send(Event::Upstream(UpstreamDelivery { message, feedback }))
            .is_ok()
    }

    /// Report a failure of the upstream receive side.
    pub fn receive_failed(&self, error: anyhow::Error) {
        let _ = self.tx.send(Event::UpstreamError(error));
    }
}

/// Collaborators one connection consumes.
pub struct AdapterInputs {
    pub sink: Arc<dyn PacketSink>,
    pub auth: Arc<dyn AuthenticationProvider>,
    pub bridge_factory: Arc<dyn MessagingBridgeFactory>,
    pub session_store: Arc<dyn SessionStateStore>,
    pub qos2_store: Arc<dyn Qos2StateStore>,
    pub metrics: Arc<AdapterMetrics>,
    pub remote_addr: Option<SocketAddr>,
}

/// Selector for the three outbound request/ack processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proc {
    PubAck,
    PubRec,
    PubComp,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    ConnectArrival,
    KeepAlive,
    AckTimeout(Proc),
}

/// Derive the packet id for an upstream sequence number.
///
/// The mapping is deterministic so a redelivered message lands on the same
/// id across reconnects, which is what lets QoS 2 resume at PUBREL. A
/// collision between distinct sequences shows up as a stale persisted
/// record and is deleted before the id is reused.
pub(crate) fn packet_id_for_sequence(sequence_number: u64) -> u16 {
    match (sequence_number & 0xFFFF) as u16 {
        0 => 1,
        id => id,
    }
}

pub struct MqttAdapter<C: Clock> {
    channel_id: String,
    config: AdapterConfig,
    clock: C,

    sink: Arc<dyn PacketSink>,
    auth: Arc<dyn AuthenticationProvider>,
    bridge_factory: Arc<dyn MessagingBridgeFactory>,
    session_store: Arc<dyn SessionStateStore>,
    qos2_store: Arc<dyn Qos2StateStore>,
    metrics: Arc<AdapterMetrics>,
    remote_addr: Option<SocketAddr>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    state: ConnectionState,
    identity: Option<Identity>,
    bridge: Option<Arc<dyn MessagingBridge>>,
    session: Option<SessionState>,
    will: Option<WillMessage>,
    keep_alive_requested: u16,
    keep_alive: Option<Duration>,
    last_activity: Instant,
    connect_deadline: Option<Instant>,

    connect_pending: Option<VecDeque<Packet>>,
    subscription_changes: Option<VecDeque<Packet>>,

    puback: AckProcessor,
    pubrec: AckProcessor,
    pubcomp: AckProcessor,
    inbound: HashMap<String, InboundProcessor>,
}

impl<C: Clock> MqttAdapter<C> {
    pub fn new(config: AdapterConfig, clock: C, inputs: AdapterInputs) -> (Self, ConnectionHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            tx: events_tx.clone(),
        };
        let ack_timeout = config.ack_timeout();
        let abort_out_of_order = config.abort_on_out_of_order_ack;
        let last_activity = clock.now();
        let adapter = Self {
            channel_id: uuid::Uuid::new_v4().to_string(),
            config,
            clock,
            sink: inputs.sink,
            auth: inputs.auth,
            bridge_factory: inputs.bridge_factory,
            session_store: inputs.session_store,
            qos2_store: inputs.qos2_store,
            metrics: inputs.metrics,
            remote_addr: inputs.remote_addr,
            events_tx,
            events_rx,
            state: ConnectionState::default(),
            identity: None,
            bridge: None,
            session: None,
            will: None,
            keep_alive_requested: 0,
            keep_alive: None,
            last_activity,
            connect_deadline: None,
            connect_pending: None,
            subscription_changes: None,
            puback: AckProcessor::new("PUBACK", ack_timeout, abort_out_of_order),
            pubrec: AckProcessor::new("PUBREC", ack_timeout, abort_out_of_order),
            pubcomp: AckProcessor::new("PUBCOMP", ack_timeout, abort_out_of_order),
            inbound: HashMap::new(),
        };
        (adapter, handle)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Drive the connection until it closes.
    pub async fn run(mut self) {
        self.metrics.connections_total.inc();
        self.metrics.connections_current.inc();
        info!(channel_id = %self.channel_id, "channel active");

        if let Some(window) = self.config.connect_arrival_timeout() {
            self.connect_deadline = Some(self.clock.now() + window);
        }
        self.sink.request_read();

        while !self.state.is_closed() {
            let timer = self.next_timer();
            let wake = timer
                .map(|(at, _)| at)
                .unwrap_or_else(|| self.clock.now() + Duration::from_secs(86_400));
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = self.clock.sleep_until(wake), if timer.is_some() => {
                    if let Some((_, kind)) = timer {
                        self.handle_timer(kind).await;
                    }
                }
            }
        }

        self.drain_after_close().await;
        info!(channel_id = %self.channel_id, "channel finished");
    }

    // -----------------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: Event) {
        if self.state.is_closed() {
            // Late completions race the close; settle what must be settled.
            match event {
                Event::Upstream(delivery) => abandon_feedback(Some(delivery.feedback)).await,
                Event::ConnectOutcome(outcome) => {
                    if let ConnectOutcome::Established { bridge, .. } = *outcome {
                        if let Err(error) = bridge.dispose(Some("connection closed".into())).await {
                            warn!(channel_id = %self.channel_id, %error, "bridge dispose failed");
                        }
                    }
                }
                _ => {}
            }
            return;
        }

        match event {
            Event::Packet(packet) => {
                self.metrics.packets_received.inc();
                self.last_activity = self.clock.now();
                self.handle_packet(packet).await;
                self.after_read_complete();
            }
            Event::TransportError(error) => {
                self.shutdown_on_error("-> Transport", AdapterError::Transport(error))
                    .await;
            }
            Event::ChannelClosed => {
                // Close without DISCONNECT is abnormal; the will fires.
                self.shutdown(Some(AdapterError::Transport(anyhow::anyhow!(
                    "channel closed by peer"
                ))))
                .await;
            }
            Event::Upstream(delivery) => self.handle_upstream(delivery).await,
            Event::UpstreamError(error) => self.shutdown_on_receive_error(error).await,
            Event::ConnectOutcome(outcome) => self.handle_connect_outcome(*outcome).await,
            Event::SubscriptionsPersisted {
                state,
                acks,
                result,
            } => self.handle_subscriptions_persisted(state, acks, result).await,
            Event::InboundSettled {
                key,
                qos,
                packet_id,
                result,
            } => self.handle_inbound_settled(key, qos, packet_id, result).await,
            Event::Shutdown => self.shutdown(None).await,
        }
    }

    /// Classify one accepted packet against the current phase.
    async fn handle_packet(&mut self, packet: Packet) {
        if self.state.is_connected() || matches!(packet, Packet::Connect(_)) {
            self.dispatch(packet).await;
        } else if self.state.phase == Phase::ProcessingConnect {
            debug!(channel_id = %self.channel_id, kind = packet.kind(), "queued behind CONNECT");
            self.connect_pending
                .get_or_insert_with(VecDeque::new)
                .push_back(packet);
        } else {
            self.shutdown_on_error("-> Dispatch", AdapterError::ConnectExpected)
                .await;
        }
    }

    async fn dispatch(&mut self, packet: Packet) {
        match packet {
            Packet::Connect(connect) => self.handle_connect(connect).await,
            Packet::Publish(publish) => self.handle_inbound_publish(publish).await,
            Packet::PubAck(packet_id) => self.handle_puback(packet_id).await,
            Packet::PubRec(packet_id) => self.handle_pubrec(packet_id).await,
            Packet::PubComp(packet_id) => self.handle_pubcomp(packet_id).await,
            packet @ (Packet::Subscribe(_) | Packet::Unsubscribe(_)) => {
                self.handle_subscription_change(packet).await;
            }
            Packet::PingReq => {
                if let Err(error) = self.write_packet(Packet::PingResp).await {
                    self.shutdown_on_error("-> PINGREQ", error).await;
                }
            }
            Packet::Disconnect => {
                // Graceful close discards the will.
                self.will = None;
                self.shutdown(None).await;
            }
            other => {
                self.shutdown_on_error(
                    "-> Dispatch",
                    AdapterError::UnknownPacketType(other.kind()),
                )
                .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // CONNECT
    // -----------------------------------------------------------------------

    async fn handle_connect(&mut self, connect: ConnectPacket) {
        if self.state.phase != Phase::WaitingForConnect {
            return self
                .shutdown_on_error("-> CONNECT", AdapterError::DuplicateConnectReceived)
                .await;
        }
        self.state.phase = Phase::ProcessingConnect;
        self.connect_deadline = None;
        self.keep_alive_requested = connect.keep_alive_secs;
        self.will = connect.will.clone();

        let credentials = ClientCredentials {
            client_id: connect.client_id,
            username: connect.username,
            password: connect.password,
            remote_addr: self.remote_addr,
        };
        let auth = Arc::clone(&self.auth);
        let factory = Arc::clone(&self.bridge_factory);
        let store = Arc::clone(&self.session_store);
        let events = self.events_tx.clone();
        let clean_session = connect.clean_session;
        tokio::spawn(async move {
            let outcome = establish_session(auth, factory, store, credentials, clean_session).await;
            let _ = events.send(Event::ConnectOutcome(Box::new(outcome)));
        });
    }

    async fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::NotAuthorized { client_id } => {
                let connack = Packet::ConnAck(ConnAckPacket {
                    session_present: false,
                    return_code: ConnectReturnCode::RefusedNotAuthorized,
                });
                if let Err(error) = self.write_packet(connack).await {
                    warn!(channel_id = %self.channel_id, %error, "CONNACK write failed");
                }
                self.shutdown_on_error("-> CONNECT", AdapterError::AuthenticationFailed { client_id })
                    .await;
            }
            ConnectOutcome::Failed(error) => {
                // Best-effort refusal before the close; CONNACK Accepted was
                // never emitted on this path.
                let connack = Packet::ConnAck(ConnAckPacket {
                    session_present: false,
                    return_code: ConnectReturnCode::RefusedServerUnavailable,
                });
                if let Err(write_error) = self.write_packet(connack).await {
                    warn!(channel_id = %self.channel_id, error = %write_error, "CONNACK write failed");
                }
                self.shutdown_on_error("-> CONNECT", error).await;
            }
            ConnectOutcome::Established {
                identity,
                bridge,
                session,
                session_present,
            } => {
                self.complete_connect(identity, bridge, session, session_present)
                    .await;
            }
        }
    }

    async fn complete_connect(
        &mut self,
        identity: Identity,
        bridge: Arc<dyn MessagingBridge>,
        session: SessionState,
        session_present: bool,
    ) {
        self.keep_alive = self.config.keep_alive_timeout(self.keep_alive_requested);
        self.identity = Some(identity.clone());
        self.session = Some(session);
        self.bridge = Some(Arc::clone(&bridge));

        let connack = Packet::ConnAck(ConnAckPacket {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        });
        if let Err(error) = self.write_packet(connack).await {
            return self.shutdown_on_error("-> CONNECT", error).await;
        }

        self.state.phase = Phase::Connected;
        self.last_activity = self.clock.now();
        info!(
            channel_id = %self.channel_id,
            identity = %identity.id,
            session_present,
            "connection established"
        );

        // Binding may start upstream delivery immediately.
        let channel = MessagingChannel {
            tx: self.events_tx.clone(),
        };
        if let Err(error) = bridge.bind_messaging_channel(channel).await {
            return self
                .shutdown_on_error("-> CONNECT", AdapterError::Messaging(error))
                .await;
        }
        if self.state.is_closed() {
            return;
        }

        // Everything that arrived behind the CONNECT runs before any newer
        // event, in arrival order.
        if let Some(mut pending) = self.connect_pending.take() {
            while let Some(packet) = pending.pop_front() {
                if self.state.is_closed() {
                    return;
                }
                self.handle_packet(packet).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscription changes
    // -----------------------------------------------------------------------

    async fn handle_subscription_change(&mut self, packet: Packet) {
        self.subscription_changes
            .get_or_insert_with(VecDeque::new)
            .push_back(packet);
        if !self.state.is_changing_subscriptions() {
            self.state.set(ConnectionFlags::CHANGING_SUBSCRIPTIONS, true);
            self.run_subscription_passes().await;
        }
    }

    /// Drain the change queue in batches: one session-state copy, all queued
    /// packets applied to it, one persist, acks in queue order. New packets
    /// arriving during the persist batch onto the next pass.
    async fn run_subscription_passes(&mut self) {
        loop {
            let Some((state, acks)) = self.collect_subscription_batch() else {
                self.state.set(ConnectionFlags::CHANGING_SUBSCRIPTIONS, false);
                return;
            };
            if state.is_transient() {
                if !self.apply_subscription_batch(state, acks).await {
                    return;
                }
                continue;
            }
            let Some(identity) = self.identity.clone() else {
                debug_assert!(false, "subscription change without identity");
                return;
            };
            let store = Arc::clone(&self.session_store);
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let result = store.set(&identity, &state).await;
                let _ = events.send(Event::SubscriptionsPersisted { state, acks, result });
            });
            return;
        }
    }

    fn collect_subscription_batch(&mut self) -> Option<(SessionState, Vec<Packet>)> {
        let queue = self.subscription_changes.as_mut()?;
        if queue.is_empty() {
            return None;
        }
        let session = self.session.as_ref()?;
        let mut state = session.copy();
        let now = self.clock.wall();
        let mut acks = Vec::with_capacity(queue.len());
        while let Some(change) = queue.pop_front() {
            match change {
                Packet::Subscribe(subscribe) => {
                    let mut granted = Vec::with_capacity(subscribe.requests.len());
                    for request in &subscribe.requests {
                        let qos = request.qos.min(self.config.max_supported_qos);
                        state.upsert_subscription(&request.topic_filter, qos, now);
                        granted.push(qos);
                    }
                    acks.push(Packet::SubAck(SubAckPacket {
                        packet_id: subscribe.packet_id,
                        granted,
                    }));
                }
                Packet::Unsubscribe(unsubscribe) => {
                    for filter in &unsubscribe.topic_filters {
                        state.remove_subscription(filter);
                    }
                    acks.push(Packet::UnsubAck(UnsubAckPacket {
                        packet_id: unsubscribe.packet_id,
                    }));
                }
                other => debug_assert!(
                    false,
                    "non-subscription packet {} in change queue",
                    other.kind()
                ),
            }
        }
        Some((state, acks))
    }

    async fn handle_subscriptions_persisted(
        &mut self,
        state: SessionState,
        acks: Vec<Packet>,
        result: anyhow::Result<()>,
    ) {
        if let Err(error) = result {
            return self
                .shutdown_on_error("-> UN/SUBSCRIBE", AdapterError::Store(error))
                .await;
        }
        if self.apply_subscription_batch(state, acks).await {
            self.run_subscription_passes().await;
        }
    }

    /// Swap the new state in and emit the acks; false if the write failed
    /// and the connection is going down.
    async fn apply_subscription_batch(&mut self, state: SessionState, acks: Vec<Packet>) -> bool {
        self.session = Some(state);
        for ack in acks {
            self.metrics.packets_written.inc();
            if let Err(error) = self.sink.write(ack).await {
                self.shutdown_on_error("-> UN/SUBSCRIBE", AdapterError::Transport(error))
                    .await;
                return false;
            }
        }
        if let Err(error) = self.sink.flush().await {
            self.shutdown_on_error("-> UN/SUBSCRIBE", AdapterError::Transport(error))
                .await;
            return false;
        }
        if let Some(bridge) = &self.bridge {
            bridge.notify_capabilities_changed();
        }
        true
    }

    // -----------------------------------------------------------------------
    // Inbound PUBLISH (device to service)
    // -----------------------------------------------------------------------

    async fn handle_inbound_publish(&mut self, publish: PublishPacket) {
        let resolved = match &self.bridge {
            Some(bridge) => bridge.try_resolve_client(&publish.topic),
            None => {
                debug_assert!(false, "inbound publish before bridge open");
                return;
            }
        };
        let Some(client) = resolved else {
            let topic = publish.topic;
            return self
                .shutdown_on_error("-> PUBLISH", AdapterError::UnresolvedSendingClient { topic })
                .await;
        };
        let key = client.id().to_string();
        let prefix = self.config.service_property_prefix.clone();
        let events = self.events_tx.clone();
        let processor = self
            .inbound
            .entry(key.clone())
            .or_insert_with(|| InboundProcessor::spawn(key, client, prefix, events));
        processor.post(publish);
        self.metrics.publishes_to_upstream.inc();
    }

    async fn handle_inbound_settled(
        &mut self,
        key: String,
        qos: Qos,
        packet_id: Option<u16>,
        result: anyhow::Result<()>,
    ) {
        if let Some(processor) = self.inbound.get_mut(&key) {
            processor.settle();
        }
        if let Err(error) = result {
            return self
                .shutdown_on_error("-> PUBLISH", AdapterError::Messaging(error))
                .await;
        }
        match qos {
            Qos::AtMostOnce => {}
            Qos::AtLeastOnce => {
                if let Some(packet_id) = packet_id {
                    if let Err(error) = self.write_packet(Packet::PubAck(packet_id)).await {
                        return self.shutdown_on_error("-> PUBACK", error).await;
                    }
                }
            }
            Qos::ExactlyOnce => {
                return self
                    .shutdown_on_error("-> PUBLISH", AdapterError::ExactlyOnceQosNotSupported)
                    .await;
            }
        }
        self.release_backpressure();
    }

    // -----------------------------------------------------------------------
    // Outbound PUBLISH (service to device)
    // -----------------------------------------------------------------------

    async fn handle_upstream(&mut self, delivery: UpstreamDelivery) {
        let UpstreamDelivery {
            mut message,
            feedback,
        } = delivery;

        let Some(message_qos) = Qos::from_level(message.qos) else {
            let level = message.qos;
            abandon_feedback(Some(feedback)).await;
            return self
                .shutdown_on_error("-> Receive", AdapterError::QosLevelNotSupported(level))
                .await;
        };

        // Retransmission path first: a processor in a retransmission round
        // whose head matches this sequence consumes the redelivery in place.
        let mut retransmit_target = None;
        for proc in [Proc::PubAck, Proc::PubRec] {
            let processor = self.proc(proc);
            if processor.is_retransmitting()
                && processor
                    .head()
                    .map_or(false, |h| h.sequence_number == message.sequence_number)
            {
                retransmit_target = Some(proc);
                break;
            }
        }
        if let Some(proc) = retransmit_target {
            return self.retransmit_publish(proc, message, feedback).await;
        }

        let Some(identity) = self.identity.clone() else {
            debug_assert!(false, "upstream delivery before connect completed");
            return;
        };
        message.properties.insert(
            format!("{}deviceId", self.config.service_property_prefix),
            identity.id.clone(),
        );

        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(matched_qos) = topics::match_subscription(
            session.subscriptions(),
            &message.topic,
            message.created_at,
            self.config.max_supported_qos,
        ) else {
            self.metrics.messages_rejected.inc();
            // Awaited so later deliveries keep their order behind this one.
            if let Err(error) = feedback.reject().await {
                warn!(channel_id = %self.channel_id, %error, "reject failed");
            }
            return;
        };

        let qos = message_qos.min(matched_qos);
        let packet_id = packet_id_for_sequence(message.sequence_number);
        match qos {
            Qos::AtMostOnce => self.send_untracked_publish(message, feedback).await,
            Qos::AtLeastOnce => {
                self.send_tracked_publish(Proc::PubAck, message, feedback, qos, packet_id)
                    .await;
            }
            Qos::ExactlyOnce => {
                self.send_exactly_once_publish(identity, message, feedback, packet_id)
                    .await;
            }
        }
        self.throttle_if_saturated();
    }

    /// QoS 0: write and complete concurrently; redeliveries are dropped.
    async fn send_untracked_publish(
        &mut self,
        message: UpstreamMessage,
        feedback: Arc<dyn FeedbackChannel>,
    ) {
        if message.delivery_count > 0 {
            if let Err(error) = feedback.complete().await {
                return self
                    .shutdown_on_error("-> PUBLISH", AdapterError::Messaging(error))
                    .await;
            }
            return;
        }
        let packet = compose_publish(&message, Qos::AtMostOnce, None, false);
        self.metrics.packets_written.inc();
        self.metrics.publishes_to_client.inc();
        let sink = Arc::clone(&self.sink);
        let write = async move {
            sink.write(packet).await?;
            sink.flush().await
        };
        let (write_result, complete_result) = tokio::join!(write, feedback.complete());
        if let Err(error) = write_result {
            return self
                .shutdown_on_error("-> PUBLISH", AdapterError::Transport(error))
                .await;
        }
        if let Err(error) = complete_result {
            self.shutdown_on_error("-> PUBLISH", AdapterError::Messaging(error))
                .await;
        }
    }

    async fn send_tracked_publish(
        &mut self,
        proc: Proc,
        message: UpstreamMessage,
        feedback: Arc<dyn FeedbackChannel>,
        qos: Qos,
        packet_id: u16,
    ) {
        let packet = compose_publish(&message, qos, Some(packet_id), false);
        let record = PendingAck {
            sequence_number: message.sequence_number,
            packet_id,
            qos,
            sent_at: self.clock.now(),
            feedback: Some(feedback),
            delivery_state: None,
        };
        self.proc_mut(proc).enqueue(record);
        self.metrics.publishes_to_client.inc();
        if let Err(error) = self.write_packet(packet).await {
            self.shutdown_on_error("-> PUBLISH", error).await;
        }
    }

    async fn send_exactly_once_publish(
        &mut self,
        identity: Identity,
        message: UpstreamMessage,
        feedback: Arc<dyn FeedbackChannel>,
        packet_id: u16,
    ) {
        let existing = match self.qos2_store.get(&identity, packet_id).await {
            Ok(existing) => existing,
            Err(error) => {
                abandon_feedback(Some(feedback)).await;
                return self
                    .shutdown_on_error("-> PUBLISH", AdapterError::Store(error))
                    .await;
            }
        };
        if self.state.is_closed() {
            return abandon_feedback(Some(feedback)).await;
        }
        match existing {
            Some(state) if state.sequence_number() == message.sequence_number => {
                // Phase one finished in an earlier session; resume at PUBREL.
                let record = PendingAck {
                    sequence_number: message.sequence_number,
                    packet_id,
                    qos: Qos::ExactlyOnce,
                    sent_at: self.clock.now(),
                    feedback: Some(feedback),
                    delivery_state: Some(state),
                };
                self.pubcomp.enqueue(record);
                if let Err(error) = self.write_packet(Packet::PubRel(packet_id)).await {
                    self.shutdown_on_error("-> PUBREL", error).await;
                }
            }
            stale => {
                if stale.is_some() {
                    // The id was reassigned to a newer sequence; the old
                    // record can never complete.
                    if let Err(error) = self.qos2_store.delete(&identity, packet_id).await {
                        abandon_feedback(Some(feedback)).await;
                        return self
                            .shutdown_on_error("-> PUBLISH", AdapterError::Store(error))
                            .await;
                    }
                    if self.state.is_closed() {
                        return abandon_feedback(Some(feedback)).await;
                    }
                }
                self.send_tracked_publish(
                    Proc::PubRec,
                    message,
                    feedback,
                    Qos::ExactlyOnce,
                    packet_id,
                )
                .await;
            }
        }
    }

    /// Re-send the head record of a retransmitting processor using the
    /// redelivered message, without allocating a new queue slot.
    async fn retransmit_publish(
        &mut self,
        proc: Proc,
        message: UpstreamMessage,
        feedback: Arc<dyn FeedbackChannel>,
    ) {
        let packet = {
            let now = self.clock.now();
            let processor = self.proc_mut(proc);
            let Some(head) = processor.head_mut() else {
                return;
            };
            head.feedback = Some(feedback);
            let packet = compose_publish(&message, head.qos, Some(head.packet_id), true);
            processor.mark_retransmitted(now);
            packet
        };
        debug!(channel_id = %self.channel_id, seq = message.sequence_number, "retransmitting publish");
        if let Err(error) = self.write_packet(packet).await {
            self.shutdown_on_error("-> PUBLISH", error).await;
        }
    }

    // -----------------------------------------------------------------------
    // Ack arrivals
    // -----------------------------------------------------------------------

    async fn handle_puback(&mut self, packet_id: u16) {
        match self.puback.post(packet_id) {
            Err(error) => self.shutdown_on_error("-> PUBACK", error).await,
            Ok(None) => {
                warn!(channel_id = %self.channel_id, packet_id, "PUBACK without pending publish");
            }
            Ok(Some(outcome)) => {
                self.settle_skipped(outcome.skipped).await;
                let mut record = outcome.record;
                if let Some(feedback) = record.feedback.take() {
                    if let Err(error) = feedback.complete().await {
                        return self
                            .shutdown_on_error("-> PUBACK", AdapterError::Messaging(error))
                            .await;
                    }
                    if self.state.is_closed() {
                        return;
                    }
                }
                self.resume_retransmission(Proc::PubAck).await;
            }
        }
    }

    async fn handle_pubrec(&mut self, packet_id: u16) {
        match self.pubrec.post(packet_id) {
            Err(error) => self.shutdown_on_error("-> PUBREC", error).await,
            Ok(None) => {
                warn!(channel_id = %self.channel_id, packet_id, "PUBREC without pending publish");
            }
            Ok(Some(outcome)) => {
                self.settle_skipped(outcome.skipped).await;
                let record = outcome.record;
                let Some(identity) = self.identity.clone() else {
                    return;
                };
                let state = self.qos2_store.create(record.sequence_number);
                if let Err(error) = self
                    .qos2_store
                    .set(&identity, record.packet_id, &state)
                    .await
                {
                    return self
                        .shutdown_on_error("-> PUBREC", AdapterError::Store(error))
                        .await;
                }
                if self.state.is_closed() {
                    return abandon_feedback(record.feedback).await;
                }
                let completion = PendingAck {
                    sequence_number: record.sequence_number,
                    packet_id: record.packet_id,
                    qos: record.qos,
                    sent_at: self.clock.now(),
                    feedback: record.feedback,
                    delivery_state: Some(state),
                };
                let packet_id = completion.packet_id;
                self.pubcomp.enqueue(completion);
                if let Err(error) = self.write_packet(Packet::PubRel(packet_id)).await {
                    return self.shutdown_on_error("-> PUBREL", error).await;
                }
                self.resume_retransmission(Proc::PubRec).await;
            }
        }
    }

    async fn handle_pubcomp(&mut self, packet_id: u16) {
        match self.pubcomp.post(packet_id) {
            Err(error) => self.shutdown_on_error("-> PUBCOMP", error).await,
            Ok(None) => {
                warn!(channel_id = %self.channel_id, packet_id, "PUBCOMP without pending release");
            }
            Ok(Some(outcome)) => {
                self.settle_skipped(outcome.skipped).await;
                let mut record = outcome.record;
                if let Some(feedback) = record.feedback.take() {
                    if let Err(error) = feedback.complete().await {
                        return self
                            .shutdown_on_error("-> PUBCOMP", AdapterError::Messaging(error))
                            .await;
                    }
                    if self.state.is_closed() {
                        return;
                    }
                }
                if record.delivery_state.is_some() {
                    if let Some(identity) = self.identity.clone() {
                        if let Err(error) =
                            self.qos2_store.delete(&identity, record.packet_id).await
                        {
                            return self
                                .shutdown_on_error("-> PUBCOMP", AdapterError::Store(error))
                                .await;
                        }
                        if self.state.is_closed() {
                            return;
                        }
                    }
                }
                self.resume_retransmission(Proc::PubComp).await;
            }
        }
    }

    /// Records bypassed by a tolerated out-of-order ack go back upstream.
    async fn settle_skipped(&mut self, skipped: Vec<PendingAck>) {
        for mut record in skipped {
            warn!(
                channel_id = %self.channel_id,
                packet_id = record.packet_id,
                "pending record skipped by out-of-order ack"
            );
            abandon_feedback(record.feedback.take()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Timers and retransmission
    // -----------------------------------------------------------------------

    fn next_timer(&self) -> Option<(Instant, TimerKind)> {
        let mut candidates: Vec<(Instant, TimerKind)> = Vec::new();
        if let Some(at) = self.connect_deadline {
            candidates.push((at, TimerKind::ConnectArrival));
        }
        if self.state.is_connected() {
            if let Some(timeout) = self.keep_alive {
                candidates.push((self.last_activity + timeout, TimerKind::KeepAlive));
            }
        }
        for proc in [Proc::PubAck, Proc::PubRec, Proc::PubComp] {
            if let Some(at) = self.proc(proc).deadline() {
                candidates.push((at, TimerKind::AckTimeout(proc)));
            }
        }
        candidates.into_iter().min_by_key(|(at, _)| *at)
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ConnectArrival => {
                if self.state.phase == Phase::WaitingForConnect {
                    let window = self
                        .config
                        .connect_arrival_timeout()
                        .unwrap_or_default();
                    self.shutdown_on_error("-> CONNECT", AdapterError::ConnectionTimedOut(window))
                        .await;
                } else {
                    self.connect_deadline = None;
                }
            }
            TimerKind::KeepAlive => {
                let Some(limit) = self.keep_alive else { return };
                let elapsed = self.clock.now() - self.last_activity;
                if elapsed >= limit {
                    self.shutdown_on_error(
                        "-> KeepAlive",
                        AdapterError::KeepAliveTimedOut { elapsed, limit },
                    )
                    .await;
                }
                // Otherwise the loop re-arms at last_activity + limit.
            }
            TimerKind::AckTimeout(proc) => self.handle_ack_timeout(proc).await,
        }
    }

    /// The head record's ack window lapsed: trigger the processor-specific
    /// retransmit action. The record stays at the head until acked or the
    /// connection closes.
    async fn handle_ack_timeout(&mut self, proc: Proc) {
        let now = self.clock.now();
        match proc {
            Proc::PubAck | Proc::PubRec => {
                // The payload is not buffered; hand the delivery back so the
                // bridge redelivers it, then match the redelivery by
                // sequence number against the head record.
                let taken = {
                    let processor = self.proc_mut(proc);
                    processor.on_timeout(now).and_then(|head| {
                        head.feedback.take().map(|feedback| (head.packet_id, feedback))
                    })
                };
                if let Some((packet_id, feedback)) = taken {
                    warn!(
                        channel_id = %self.channel_id,
                        packet_id,
                        "ack timed out; requesting redelivery"
                    );
                    abandon_feedback(Some(feedback)).await;
                }
            }
            Proc::PubComp => {
                // PUBREL is recomposable from the packet id; rewrite it.
                let packet_id = self.pubcomp.on_timeout(now).map(|head| head.packet_id);
                if let Some(packet_id) = packet_id {
                    warn!(channel_id = %self.channel_id, packet_id, "PUBCOMP timed out; resending PUBREL");
                    match self.write_packet(Packet::PubRel(packet_id)).await {
                        Ok(()) => self.pubcomp.mark_retransmitted(self.clock.now()),
                        Err(error) => self.shutdown_on_error("-> PUBREL", error).await,
                    }
                }
            }
        }
    }

    /// After an ack settles during a retransmission round, move the round to
    /// the next head, if any.
    async fn resume_retransmission(&mut self, proc: Proc) {
        match proc {
            Proc::PubAck | Proc::PubRec => {
                let feedback = {
                    let processor = self.proc_mut(proc);
                    match processor.resume_retransmission() {
                        None => return,
                        Some(head) => head.feedback.take(),
                    }
                };
                abandon_feedback(feedback).await;
            }
            Proc::PubComp => {
                let packet_id = match self.pubcomp.resume_retransmission() {
                    None => return,
                    Some(head) => head.packet_id,
                };
                match self.write_packet(Packet::PubRel(packet_id)).await {
                    Ok(()) => self.pubcomp.mark_retransmitted(self.clock.now()),
                    Err(error) => self.shutdown_on_error("-> PUBREL", error).await,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    fn inbound_backlog(&self) -> usize {
        self.puback.backlog() + self.pubrec.backlog() + self.pubcomp.backlog()
    }

    fn read_allowed(&self) -> bool {
        self.inbound_backlog() < self.config.max_pending_inbound_acks
            && self.inbound.values().all(InboundProcessor::has_capacity)
    }

    /// A read completed (a packet was handled): request the next one, or
    /// throttle until backlog drains.
    fn after_read_complete(&mut self) {
        if self.state.is_closed() {
            return;
        }
        if self.read_allowed() {
            self.state.set(ConnectionFlags::READ_THROTTLED, false);
            self.sink.request_read();
        } else {
            self.state.set(ConnectionFlags::READ_THROTTLED, true);
        }
    }

    /// Backlog was consumed outside packet handling: resume reading if the
    /// throttle was the only thing holding reads back.
    fn release_backpressure(&mut self) {
        if self.state.is_closed() || !self.state.is_read_throttled() {
            return;
        }
        if self.read_allowed() {
            self.state.set(ConnectionFlags::READ_THROTTLED, false);
            self.sink.request_read();
        }
    }

    /// Outbound sends grow the backlog without a read completing; record the
    /// throttled state so no further reads are requested.
    fn throttle_if_saturated(&mut self) {
        if !self.state.is_closed() && !self.read_allowed() {
            self.state.set(ConnectionFlags::READ_THROTTLED, true);
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    async fn shutdown_on_error(&mut self, scope: &'static str, error: AdapterError) {
        if self.state.is_closed() {
            return;
        }
        self.metrics.error_shutdowns.inc();
        warn!(
            channel_id = %self.channel_id,
            scope,
            error = %error,
            "shutting down on error"
        );
        self.shutdown(Some(error)).await;
    }

    /// The upstream receive side failed: nothing further will be delivered,
    /// so outstanding records go back for redelivery immediately, then the
    /// regular funnel runs.
    async fn shutdown_on_receive_error(&mut self, error: anyhow::Error) {
        if self.state.is_closed() {
            return;
        }
        for proc in [Proc::PubAck, Proc::PubRec, Proc::PubComp] {
            let failed = self.proc_mut(proc).abort();
            for mut record in failed {
                abandon_feedback(record.feedback.take()).await;
            }
        }
        self.shutdown_on_error("-> Receive", AdapterError::Messaging(error))
            .await;
    }

    async fn shutdown(&mut self, cause: Option<AdapterError>) {
        if self.state.is_closed() {
            return;
        }
        self.state.set(ConnectionFlags::CLOSED, true);
        self.metrics.connections_current.dec();

        let was_connected = self.state.is_connected();
        let cause_label = cause.as_ref().map(|error| error.to_string());
        self.connect_pending = None;

        let will = if cause.is_some() && was_connected {
            self.will.take()
        } else {
            None
        };

        if let Some(bridge) = self.bridge.take() {
            // Quiesce the outbound processors. Outstanding exchanges can no
            // longer complete on this channel; their deliveries go back so
            // the bridge redelivers them to the next session.
            for proc in [Proc::PubAck, Proc::PubRec, Proc::PubComp] {
                self.proc_mut(proc).begin_complete();
                let failed = self.proc_mut(proc).abort();
                for mut record in failed {
                    abandon_feedback(record.feedback.take()).await;
                }
                debug_assert!(self.proc(proc).is_drained());
            }
            if let Some(will) = will {
                self.publish_will(bridge.as_ref(), will).await;
            }
            if let Err(error) = bridge.dispose(cause_label.clone()).await {
                warn!(channel_id = %self.channel_id, %error, "bridge dispose failed");
            }
        }

        if let Err(error) = self.sink.close().await {
            debug!(channel_id = %self.channel_id, %error, "transport close failed");
        }
        info!(
            channel_id = %self.channel_id,
            cause = cause_label.as_deref().unwrap_or("graceful"),
            "connection closed"
        );
    }

    /// Will delivery is best effort: failures are logged, never propagated.
    async fn publish_will(&self, bridge: &dyn MessagingBridge, will: WillMessage) {
        let Some(client) = bridge.try_resolve_client(&will.topic) else {
            warn!(channel_id = %self.channel_id, topic = %will.topic, "no upstream client for will topic");
            return;
        };
        let message = build_upstream_message(
            client.as_ref(),
            &will.topic,
            will.payload.clone(),
            will.qos,
            will.retain,
            &self.config.service_property_prefix,
            true,
        );
        if let Err(error) = client.send(message).await {
            warn!(channel_id = %self.channel_id, %error, "will publish failed");
        }
    }

    /// Settle whatever was still queued when the loop stopped.
    async fn drain_after_close(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Event::Upstream(delivery) = event {
                abandon_feedback(Some(delivery.feedback)).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn proc(&self, proc: Proc) -> &AckProcessor {
        match proc {
            Proc::PubAck => &self.puback,
            Proc::PubRec => &self.pubrec,
            Proc::PubComp => &self.pubcomp,
        }
    }

    fn proc_mut(&mut self, proc: Proc) -> &mut AckProcessor {
        match proc {
            Proc::PubAck => &mut self.puback,
            Proc::PubRec => &mut self.pubrec,
            Proc::PubComp => &mut self.pubcomp,
        }
    }

    async fn write_packet(&mut self, packet: Packet) -> Result<(), AdapterError> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.metrics.packets_written.inc();
        self.sink
            .write(packet)
            .await
            .map_err(AdapterError::Transport)?;
        self.sink.flush().await.map_err(AdapterError::Transport)?;
        Ok(())
    }
}

/// The spawned CONNECT establishment: authenticate, open the bridge, and
/// load or create session state.
async fn establish_session(
    auth: Arc<dyn AuthenticationProvider>,
    factory: Arc<dyn MessagingBridgeFactory>,
    store: Arc<dyn SessionStateStore>,
    credentials: ClientCredentials,
    clean_session: bool,
) -> ConnectOutcome {
    let identity = match auth.authenticate(&credentials).await {
        Ok(identity) => identity,
        Err(error) => {
            return ConnectOutcome::Failed(AdapterError::Store(
                error.context("authentication provider failed"),
            ))
        }
    };
    if !identity.authenticated {
        return ConnectOutcome::NotAuthorized {
            client_id: credentials.client_id,
        };
    }

    let bridge = match factory.open(&identity).await {
        Ok(bridge) => bridge,
        Err(error) => return ConnectOutcome::Failed(AdapterError::Messaging(error)),
    };

    let established = if clean_session {
        match store.delete(&identity).await {
            Ok(()) => Ok((store.create(true), false)),
            Err(error) => Err(AdapterError::Store(error)),
        }
    } else {
        match store.get(&identity).await {
            Ok(Some(state)) => Ok((state, true)),
            Ok(None) => Ok((store.create(false), false)),
            Err(error) => Err(AdapterError::Store(error)),
        }
    };

    match established {
        Ok((session, session_present)) => ConnectOutcome::Established {
            identity,
            bridge,
            session,
            session_present,
        },
        Err(error) => {
            if let Err(dispose_error) = bridge.dispose(Some(error.to_string())).await {
                warn!(error = %dispose_error, "bridge dispose after failed connect");
            }
            ConnectOutcome::Failed(error)
        }
    }
}

fn compose_publish(
    message: &UpstreamMessage,
    qos: Qos,
    packet_id: Option<u16>,
    dup: bool,
) -> Packet {
    Packet::Publish(PublishPacket {
        topic: message.topic.clone(),
        payload: message.payload.clone(),
        qos,
        packet_id,
        dup,
        retain: false,
    })
}

async fn abandon_feedback(feedback: Option<Arc<dyn FeedbackChannel>>) {
    if let Some(feedback) = feedback {
        if let Err(error) = feedback.abandon().await {
            warn!(%error, "abandon failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_stable_per_sequence() {
        assert_eq!(packet_id_for_sequence(42), 42);
        assert_eq!(packet_id_for_sequence(42), packet_id_for_sequence(42));
        assert_eq!(packet_id_for_sequence(0x1_0007), 7);
    }

    #[test]
    fn packet_id_zero_is_never_used() {
        assert_eq!(packet_id_for_sequence(0), 1);
        assert_eq!(packet_id_for_sequence(0x10000), 1);
    }
}
