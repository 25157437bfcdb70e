//! Subscriber Delivery Channels
//!
//! Each downstream session owns one bounded mpsc channel. The relay holds
//! the sending half as a [`SubscriberHandle`] and delivers to it with a
//! non-blocking `try_send`, so a slow client never slows the upstream
//! connector.
//!
//! # Architecture
//!
//! ```text
//! Connector ──► FanoutRouter ──try_send──► SubscriberHandle ──► session writer ──► socket
//! ```
//!
//! Frames are shared `Arc<str>` so one upstream message fanned out to N
//! subscribers is allocated once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::domain::subscription::SubscriberId;

/// One outbound text frame, shared across subscribers.
pub type OutboundFrame = Arc<str>;

// =============================================================================
// Send Outcome
// =============================================================================

/// Result of a best-effort delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued for the subscriber.
    Delivered,
    /// Subscriber queue is full; frame dropped.
    Full,
    /// Subscriber has gone away; frame dropped.
    Closed,
}

impl SendOutcome {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Full => "full",
            Self::Closed => "closed",
        }
    }
}

// =============================================================================
// Subscriber Handle
// =============================================================================

/// Sending half of a subscriber's outbound queue.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: SubscriberId,
    tx: mpsc::Sender<OutboundFrame>,
}

impl SubscriberHandle {
    /// Create a handle with a fresh random id and its receiving half.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        Self::with_id(uuid::Uuid::new_v4().as_u64_pair().0, capacity)
    }

    /// Create a handle with a fixed id.
    #[must_use]
    pub fn with_id(id: SubscriberId, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    /// Subscriber id.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue a frame without waiting.
    #[must_use]
    pub fn try_deliver(&self, frame: &OutboundFrame) -> SendOutcome {
        match self.tx.try_send(Arc::clone(frame)) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Whether the receiving half has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// =============================================================================
// Delivery Report
// =============================================================================

/// Outcome counts for one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Frames queued.
    pub delivered: usize,
    /// Frames dropped because a queue was full.
    pub dropped: usize,
    /// Frames dropped because a subscriber was gone.
    pub closed: usize,
}

impl DeliveryReport {
    /// Record one outcome.
    pub const fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Delivered => self.delivered += 1,
            SendOutcome::Full => self.dropped += 1,
            SendOutcome::Closed => self.closed += 1,
        }
    }

    /// Total subscribers attempted.
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.delivered + self.dropped + self.closed
    }
}

/// Deliver `frame` to every handle.
#[must_use]
pub fn deliver_all<'a>(
    handles: impl IntoIterator<Item = &'a SubscriberHandle>,
    frame: &OutboundFrame,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for handle in handles {
        let outcome = handle.try_deliver(frame);
        if outcome != SendOutcome::Delivered {
            tracing::debug!(
                subscriber_id = handle.id(),
                outcome = outcome.as_str(),
                "Dropped frame for subscriber"
            );
        }
        report.record(outcome);
    }

    report
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> OutboundFrame {
        Arc::from(text)
    }

    #[tokio::test]
    async fn delivers_to_open_subscriber() {
        let (handle, mut rx) = SubscriberHandle::with_id(1, 4);

        assert_eq!(handle.try_deliver(&frame("hello")), SendOutcome::Delivered);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[test]
    fn full_queue_drops() {
        let (handle, _rx) = SubscriberHandle::with_id(1, 1);

        assert_eq!(handle.try_deliver(&frame("a")), SendOutcome::Delivered);
        assert_eq!(handle.try_deliver(&frame("b")), SendOutcome::Full);
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (handle, rx) = SubscriberHandle::with_id(1, 4);
        drop(rx);

        assert!(handle.is_closed());
        assert_eq!(handle.try_deliver(&frame("a")), SendOutcome::Closed);
    }

    #[test]
    fn zero_capacity_is_raised() {
        let (handle, _rx) = SubscriberHandle::with_id(1, 0);

        assert_eq!(handle.try_deliver(&frame("a")), SendOutcome::Delivered);
    }

    #[test]
    fn random_ids_differ() {
        let (a, _rx_a) = SubscriberHandle::channel(1);
        let (b, _rx_b) = SubscriberHandle::channel(1);

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn deliver_all_counts_outcomes() {
        let (open, _open_rx) = SubscriberHandle::with_id(1, 4);
        let (full, _full_rx) = SubscriberHandle::with_id(2, 1);
        let (gone, gone_rx) = SubscriberHandle::with_id(3, 4);
        drop(gone_rx);

        let _ = full.try_deliver(&frame("prefill"));

        let report = deliver_all([&open, &full, &gone], &frame("tick"));

        assert_eq!(
            report,
            DeliveryReport {
                delivered: 1,
                dropped: 1,
                closed: 1,
            }
        );
        assert_eq!(report.attempted(), 3);
    }
}
