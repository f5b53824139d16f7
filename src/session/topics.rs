//! Topic-filter matching and subscription selection.
//!
//! Filter matching follows MQTT 3.1.1 section 4.7: `+` matches exactly one
//! level, `#` matches the remaining levels and must be last. Subscription
//! selection layers the time gate on top: a subscription never claims a
//! message created at or before the subscription itself.

use crate::protocol::Qos;
use crate::session::Subscription;
use std::time::SystemTime;

/// Check whether a topic filter matches a concrete topic name.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(level), Some(name)) if level == name => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Select the delivery QoS for a message on `topic` created at `message_time`.
///
/// Among subscriptions whose filter matches and whose creation stamp
/// predates the message, the highest QoS wins, capped at `server_max`. The
/// scan short-circuits once the cap is reached. `None` means no subscription
/// applies and the message is rejected upstream.
pub fn match_subscription(
    subscriptions: &[Subscription],
    topic: &str,
    message_time: SystemTime,
    server_max: Qos,
) -> Option<Qos> {
    let mut best: Option<Qos> = None;
    for subscription in subscriptions {
        if subscription.created_at >= message_time {
            continue;
        }
        if !topic_matches(&subscription.topic_filter, topic) {
            continue;
        }
        let granted = subscription.qos.min(server_max);
        if best.map_or(true, |current| granted > current) {
            best = Some(granted);
        }
        if best == Some(server_max) {
            break;
        }
    }
    best
}
