//! Adapter error taxonomy.
//!
//! Every failure path in the adapter converges on
//! `MqttAdapter::shutdown_on_error`, which tags the error with an operation
//! scope and the channel id before driving the orderly close. Collaborator
//! failures arrive as `anyhow::Error` and are wrapped by source.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("packet received before CONNECT")]
    ConnectExpected,

    #[error("duplicate CONNECT received on an established session")]
    DuplicateConnectReceived,

    #[error("authentication failed for client `{client_id}`")]
    AuthenticationFailed { client_id: String },

    #[error("no CONNECT received within {0:?} of channel activation")]
    ConnectionTimedOut(Duration),

    #[error("keep-alive lapsed: {elapsed:?} since last client activity exceeds {limit:?}")]
    KeepAliveTimedOut { elapsed: Duration, limit: Duration },

    #[error("unsupported packet type {0}")]
    UnknownPacketType(&'static str),

    #[error("no upstream client resolves topic `{topic}`")]
    UnresolvedSendingClient { topic: String },

    #[error("QoS 2 publishes from the client are not supported")]
    ExactlyOnceQosNotSupported,

    #[error("QoS level {0} is not supported for outbound delivery")]
    QosLevelNotSupported(u8),

    #[error("{processor} received ack for packet {received} while {expected} heads the queue")]
    OutOfOrderAck {
        processor: &'static str,
        received: u16,
        expected: u16,
    },

    #[error("transport failure: {0}")]
    Transport(anyhow::Error),

    #[error("state store failure: {0}")]
    Store(anyhow::Error),

    #[error("upstream messaging failure: {0}")]
    Messaging(anyhow::Error),
}
