//! Outbound request/ack processor.
//!
//! Three instances govern the PUBLISH→PUBACK, PUBLISH→PUBREC, and
//! PUBREL→PUBCOMP exchanges. Each owns an in-order queue of pending records
//! and enforces the ordering contract: acks settle strictly in send order,
//! and the head of the queue is never bypassed. What happens on a mismatch
//! is policy - abort the connection, or walk forward and treat the skipped
//! records as lost.

use crate::bridge::FeedbackChannel;
use crate::error::AdapterError;
use crate::protocol::Qos;
use crate::qos2::DeliveryState;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight outbound exchange awaiting its ack.
pub(crate) struct PendingAck {
    pub sequence_number: u64,
    pub packet_id: u16,
    pub qos: Qos,
    pub sent_at: Instant,
    /// Settlement handle for the upstream delivery; taken exactly once.
    pub feedback: Option<Arc<dyn FeedbackChannel>>,
    /// Persisted QoS 2 record riding along between PUBREC and PUBCOMP.
    pub delivery_state: Option<DeliveryState>,
}

impl std::fmt::Debug for PendingAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAck")
            .field("sequence_number", &self.sequence_number)
            .field("packet_id", &self.packet_id)
            .field("qos", &self.qos)
            .field("sent_at", &self.sent_at)
            .field("delivery_state", &self.delivery_state)
            .finish()
    }
}

/// Result of matching an ack against the queue.
pub(crate) struct AckOutcome {
    pub record: PendingAck,
    /// Records bypassed by a tolerated out-of-order ack, oldest first.
    pub skipped: Vec<PendingAck>,
}

impl std::fmt::Debug for AckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckOutcome")
            .field("record", &self.record)
            .field("skipped", &self.skipped)
            .finish()
    }
}

pub(crate) struct AckProcessor {
    name: &'static str,
    queue: VecDeque<PendingAck>,
    ack_timeout: Option<Duration>,
    abort_on_out_of_order: bool,
    retransmitting: bool,
    deadline: Option<Instant>,
    completing: bool,
}

impl AckProcessor {
    pub fn new(
        name: &'static str,
        ack_timeout: Option<Duration>,
        abort_on_out_of_order: bool,
    ) -> Self {
        Self {
            name,
            queue: VecDeque::new(),
            ack_timeout,
            abort_on_out_of_order,
            retransmitting: false,
            deadline: None,
            completing: false,
        }
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn head(&self) -> Option<&PendingAck> {
        self.queue.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut PendingAck> {
        self.queue.front_mut()
    }

    pub fn is_retransmitting(&self) -> bool {
        self.retransmitting
    }

    /// Queue a freshly sent request. The ack timer arms when this record
    /// becomes the head.
    pub fn enqueue(&mut self, record: PendingAck) {
        debug_assert!(!self.completing, "{}: send after complete", self.name);
        if self.queue.is_empty() {
            self.deadline = self.ack_timeout.map(|t| record.sent_at + t);
        }
        self.queue.push_back(record);
    }

    /// Match an inbound ack against the queue.
    ///
    /// `Ok(Some(..))` settles the matched record; `Ok(None)` means the ack
    /// found nothing to match and is ignored; `Err` is the fatal
    /// out-of-order policy.
    pub fn post(&mut self, packet_id: u16) -> Result<Option<AckOutcome>, AdapterError> {
        let Some(head) = self.queue.front() else {
            return Ok(None);
        };
        if head.packet_id == packet_id {
            let record = self.queue.pop_front().expect("head exists");
            self.rearm();
            return Ok(Some(AckOutcome {
                record,
                skipped: Vec::new(),
            }));
        }
        if self.abort_on_out_of_order {
            return Err(AdapterError::OutOfOrderAck {
                processor: self.name,
                received: packet_id,
                expected: head.packet_id,
            });
        }
        // Tolerant policy: walk forward and drop intervening records as lost.
        let Some(position) = self.queue.iter().position(|r| r.packet_id == packet_id) else {
            return Ok(None);
        };
        let mut skipped = Vec::with_capacity(position);
        for _ in 0..position {
            skipped.push(self.queue.pop_front().expect("skipped record exists"));
        }
        let record = self.queue.pop_front().expect("matched record exists");
        self.rearm();
        Ok(Some(AckOutcome { record, skipped }))
    }

    /// Deadline for the head record's ack, if the timer is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The head record's ack timer fired: enter retransmission, rearm, and
    /// hand the head back for the processor-specific retransmit action.
    pub fn on_timeout(&mut self, now: Instant) -> Option<&mut PendingAck> {
        if self.queue.is_empty() {
            self.deadline = None;
            return None;
        }
        self.retransmitting = true;
        self.deadline = self.ack_timeout.map(|t| now + t);
        self.queue.front_mut()
    }

    /// A request was re-sent; restart its ack window.
    pub fn mark_retransmitted(&mut self, now: Instant) {
        if let Some(head) = self.queue.front_mut() {
            head.sent_at = now;
        }
        self.deadline = self.ack_timeout.map(|t| now + t);
    }

    /// After an ack settles: the next head continues the retransmission
    /// round, or the round ends with an empty queue.
    pub fn resume_retransmission(&mut self) -> Option<&mut PendingAck> {
        if !self.retransmitting {
            return None;
        }
        if self.queue.is_empty() {
            self.retransmitting = false;
            return None;
        }
        self.queue.front_mut()
    }

    /// Stop accepting new sends; the queue drains through acks.
    pub fn begin_complete(&mut self) {
        self.completing = true;
    }

    pub fn is_drained(&self) -> bool {
        self.completing && self.queue.is_empty()
    }

    /// Fail every outstanding record. The caller abandons their feedback
    /// channels so the upstream bridge redelivers.
    pub fn abort(&mut self) -> Vec<PendingAck> {
        self.completing = true;
        self.retransmitting = false;
        self.deadline = None;
        self.queue.drain(..).collect()
    }

    fn rearm(&mut self) {
        self.deadline = match (self.ack_timeout, self.queue.front()) {
            (Some(t), Some(head)) => Some(head.sent_at + t),
            _ => None,
        };
    }
}
