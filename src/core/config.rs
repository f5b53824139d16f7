//! Adapter configuration.
//!
//! Options mirror what deployments tune per listener: the CONNECT arrival
//! window, the keep-alive cap, outbound ack timeouts, the out-of-order ack
//! policy, and the read-throttle bound. Durations are carried as integer
//! seconds in configuration files and surfaced as `Duration` accessors.

use crate::protocol::Qos;
use serde::Deserialize;
use std::time::Duration;

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_max_pending_inbound_acks() -> usize {
    16
}

fn default_service_property_prefix() -> String {
    "$gw.".to_string()
}

fn default_max_supported_qos() -> Qos {
    Qos::ExactlyOnce
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    /// Maximum time from channel activation to the CONNECT packet.
    /// `None` disables the arrival timer.
    #[serde(default)]
    pub connect_arrival_timeout_secs: Option<u64>,

    /// Cap applied to the keep-alive timeout derived from the client's
    /// requested value. A client that requests zero falls back to this cap.
    #[serde(default)]
    pub max_keep_alive_timeout_secs: Option<u64>,

    /// Ack timeout for the outbound request/ack processors.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Whether outbound processors arm the ack timer at all.
    #[serde(default)]
    pub ack_can_timeout: bool,

    /// When set, an ack that does not match the head of its processor's
    /// queue shuts the connection down; otherwise intervening records are
    /// skipped as lost.
    #[serde(default)]
    pub abort_on_out_of_order_ack: bool,

    /// Aggregate pending-ack bound across the three outbound processors;
    /// reads are throttled once reached.
    #[serde(default = "default_max_pending_inbound_acks")]
    pub max_pending_inbound_acks: usize,

    /// Prefix for message properties set by the adapter itself.
    #[serde(default = "default_service_property_prefix")]
    pub service_property_prefix: String,

    /// Highest QoS granted in SUBACK and used for outbound delivery.
    #[serde(default = "default_max_supported_qos")]
    pub max_supported_qos: Qos,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            connect_arrival_timeout_secs: None,
            max_keep_alive_timeout_secs: None,
            ack_timeout_secs: default_ack_timeout_secs(),
            ack_can_timeout: false,
            abort_on_out_of_order_ack: false,
            max_pending_inbound_acks: default_max_pending_inbound_acks(),
            service_property_prefix: default_service_property_prefix(),
            max_supported_qos: default_max_supported_qos(),
        }
    }
}

impl AdapterConfig {
    pub fn connect_arrival_timeout(&self) -> Option<Duration> {
        self.connect_arrival_timeout_secs.map(Duration::from_secs)
    }

    pub fn max_keep_alive_timeout(&self) -> Option<Duration> {
        self.max_keep_alive_timeout_secs.map(Duration::from_secs)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_can_timeout
            .then(|| Duration::from_secs(self.ack_timeout_secs))
    }

    /// Derive the effective keep-alive timeout from the client's requested
    /// value: 1.5x the request, capped by the configured maximum. A zero
    /// request falls back to the maximum; with neither, keep-alive is off.
    pub fn keep_alive_timeout(&self, requested_secs: u16) -> Option<Duration> {
        let cap = self.max_keep_alive_timeout();
        if requested_secs == 0 {
            return cap;
        }
        let derived = Duration::from_millis(u64::from(requested_secs) * 1500);
        match cap {
            Some(cap) if cap < derived => Some(cap),
            _ => Some(derived),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_on_empty_document() {
        let cfg: AdapterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.connect_arrival_timeout(), None);
        assert_eq!(cfg.ack_timeout_secs, 30);
        assert!(cfg.ack_timeout().is_none());
        assert_eq!(cfg.max_pending_inbound_acks, 16);
        assert_eq!(cfg.max_supported_qos, Qos::ExactlyOnce);
        assert!(!cfg.abort_on_out_of_order_ack);
    }

    #[test]
    fn ack_timeout_requires_opt_in() {
        let cfg: AdapterConfig =
            serde_json::from_str(r#"{"ack_timeout_secs": 5, "ack_can_timeout": true}"#).unwrap();
        assert_eq!(cfg.ack_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn keep_alive_is_one_and_a_half_times_request() {
        let cfg = AdapterConfig::default();
        assert_eq!(cfg.keep_alive_timeout(10), Some(Duration::from_secs(15)));
    }

    #[test]
    fn keep_alive_capped_by_configured_maximum() {
        let cfg = AdapterConfig {
            max_keep_alive_timeout_secs: Some(12),
            ..AdapterConfig::default()
        };
        assert_eq!(cfg.keep_alive_timeout(10), Some(Duration::from_secs(12)));
        assert_eq!(cfg.keep_alive_timeout(4), Some(Duration::from_secs(6)));
    }

    #[test]
    fn zero_request_falls_back_to_maximum() {
        let cfg = AdapterConfig {
            max_keep_alive_timeout_secs: Some(300),
            ..AdapterConfig::default()
        };
        assert_eq!(cfg.keep_alive_timeout(0), Some(Duration::from_secs(300)));

        let uncapped = AdapterConfig::default();
        assert_eq!(uncapped.keep_alive_timeout(0), None);
    }
}
