//! Decoded MQTT v3.1.1 control-packet model.
//!
//! Framing and the byte codec belong to the transport collaborator; the
//! adapter consumes and produces packets that are already decoded. Shapes
//! mirror the wire layout: owned topic strings, `Bytes` payloads, and a
//! packet identifier only where the protocol carries one.

use bytes::Bytes;

/// MQTT delivery guarantee level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery (PUBACK).
    AtLeastOnce,
    /// Two-phase delivery (PUBREC/PUBREL/PUBCOMP).
    ExactlyOnce,
}

impl Qos {
    /// Map a wire-level QoS value; `None` for reserved levels.
    pub fn from_level(level: u8) -> Option<Qos> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// CONNACK return codes defined by MQTT 3.1.1 section 3.2.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    RefusedUnacceptableProtocolVersion,
    RefusedIdentifierRejected,
    RefusedServerUnavailable,
    RefusedBadCredentials,
    RefusedNotAuthorized,
}

/// Will message declared in the CONNECT payload.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub will: Option<WillMessage>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    /// Present for QoS 1 and 2 only.
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub topic_filter: String,
    pub qos: Qos,
}

#[derive(Debug, Clone)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub requests: Vec<SubscriptionRequest>,
}

#[derive(Debug, Clone)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// Granted QoS per filter, in request order.
    pub granted: Vec<Qos>,
}

#[derive(Debug, Clone)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
}

/// A decoded control packet.
#[derive(Debug, Clone)]
pub enum Packet {
    Connect(ConnectPacket),
    ConnAck(ConnAckPacket),
    Publish(PublishPacket),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(SubscribePacket),
    SubAck(SubAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubAck(UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Wire name of the packet type, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
