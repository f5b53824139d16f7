//! Transport collaborator interface.
//!
//! The listener owns the socket, TLS, and the packet codec. It feeds decoded
//! packets into the adapter through [`ConnectionHandle`](crate::connection::ConnectionHandle)
//! and consumes outbound packets through this sink. Reads are demand-driven:
//! the transport delivers one packet per `request_read` call, which is how
//! the adapter applies read throttling without touching the socket.

use crate::protocol::Packet;
use async_trait::async_trait;

#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Queue a packet for the wire.
    async fn write(&self, packet: Packet) -> anyhow::Result<()>;

    /// Push queued packets out.
    async fn flush(&self) -> anyhow::Result<()>;

    /// Ask the transport to decode and deliver one more inbound packet.
    fn request_read(&self);

    /// Close the channel. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}
