//! Connection lifecycle state.
//!
//! The lifecycle phase is a mutually exclusive progression; the flags are
//! orthogonal modifiers that can hold in any phase. Everything lives on the
//! connection task, so there is no synchronization here.

use bitflags::bitflags;

/// Where the connection is in its CONNECT handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Channel is active, no CONNECT seen yet.
    WaitingForConnect,
    /// CONNECT is being processed; other packets queue behind it.
    ProcessingConnect,
    /// CONNACK `Accepted` was sent; normal traffic flows.
    Connected,
}

bitflags! {
    /// Modifier flags orthogonal to the phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionFlags: u8 {
        /// A subscription-change batch has a persist in flight.
        const CHANGING_SUBSCRIPTIONS = 1 << 0;
        /// Backlog bounds reached; no further reads are requested.
        const READ_THROTTLED = 1 << 1;
        /// Shutdown ran; no packet may be written, no bridge call made.
        const CLOSED = 1 << 2;
    }
}

/// Phase plus flags, with the accessors the handlers lean on.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionState {
    pub phase: Phase,
    flags: ConnectionFlags,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: Phase::WaitingForConnect,
            flags: ConnectionFlags::empty(),
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(ConnectionFlags::CLOSED)
    }

    pub fn is_changing_subscriptions(&self) -> bool {
        self.flags.contains(ConnectionFlags::CHANGING_SUBSCRIPTIONS)
    }

    pub fn is_read_throttled(&self) -> bool {
        self.flags.contains(ConnectionFlags::READ_THROTTLED)
    }

    pub fn set(&mut self, flag: ConnectionFlags, value: bool) {
        self.flags.set(flag, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_waiting_with_no_flags() {
        let state = ConnectionState::default();
        assert_eq!(state.phase, Phase::WaitingForConnect);
        assert!(!state.is_closed());
        assert!(!state.is_read_throttled());
        assert!(!state.is_changing_subscriptions());
    }

    #[test]
    fn flags_are_orthogonal_to_phase() {
        let mut state = ConnectionState::default();
        state.phase = Phase::Connected;
        state.set(ConnectionFlags::READ_THROTTLED, true);
        state.set(ConnectionFlags::CLOSED, true);
        assert!(state.is_connected());
        assert!(state.is_read_throttled());
        assert!(state.is_closed());

        state.set(ConnectionFlags::READ_THROTTLED, false);
        assert!(!state.is_read_throttled());
        assert!(state.is_closed());
    }
}
