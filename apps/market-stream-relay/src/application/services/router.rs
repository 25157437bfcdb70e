//! Fan-out Router
//!
//! Delivers one frame to every subscriber registered for a key. The
//! subscriber list is snapshotted under the read lock and the lock is
//! released before any send, so registration changes never wait on delivery.

use std::sync::Arc;

use parking_lot::RwLock;

use super::registry::SubscriptionState;
use crate::domain::stream::StreamKey;
use crate::domain::summary::SummaryRecord;
use crate::infrastructure::broadcast::{DeliveryReport, OutboundFrame, SubscriberHandle, deliver_all};
use crate::infrastructure::metrics::{self, DeliveryPath};

/// Routes frames from connectors to subscriber queues.
#[derive(Debug, Clone)]
pub struct FanoutRouter {
    state: Arc<RwLock<SubscriptionState>>,
}

impl FanoutRouter {
    /// Create a router over shared subscription state.
    #[must_use]
    pub const fn new(state: Arc<RwLock<SubscriptionState>>) -> Self {
        Self { state }
    }

    /// Deliver a raw frame to the subscribers of `key`.
    pub fn publish(&self, key: &StreamKey, frame: &OutboundFrame) -> DeliveryReport {
        let handles = self.subscribers_of(key);
        Self::deliver(DeliveryPath::Raw, &handles, frame)
    }

    /// Point-in-time copy of the handles subscribed to `key`.
    #[must_use]
    pub fn subscribers_of(&self, key: &StreamKey) -> Vec<SubscriberHandle> {
        self.state.read().stream_handles(key)
    }

    /// Deliver to an already-taken snapshot. Subscribers added after the
    /// snapshot do not receive the frame.
    pub fn deliver(
        path: DeliveryPath,
        handles: &[SubscriberHandle],
        frame: &OutboundFrame,
    ) -> DeliveryReport {
        if handles.is_empty() {
            return DeliveryReport::default();
        }
        let report = deliver_all(handles, frame);
        metrics::record_delivery(path, &report);
        report
    }

    /// Deliver a summary envelope to the subscribers of its symbol.
    pub fn publish_summary(&self, record: &SummaryRecord) -> DeliveryReport {
        let handles = self.state.read().summary_handles(&record.routing_symbol());
        if handles.is_empty() {
            return DeliveryReport::default();
        }

        let envelope = match record.to_envelope_json() {
            Ok(json) => OutboundFrame::from(json),
            Err(e) => {
                tracing::warn!(symbol = %record.symbol, error = %e, "Failed to encode summary");
                return DeliveryReport::default();
            }
        };

        Self::deliver(DeliveryPath::Summary, &handles, &envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stream::StreamType;

    fn key(symbol: &str) -> StreamKey {
        StreamKey::new(StreamType::Ticker, symbol).unwrap()
    }

    fn shared() -> Arc<RwLock<SubscriptionState>> {
        Arc::new(RwLock::new(SubscriptionState::default()))
    }

    #[tokio::test]
    async fn publish_reaches_exactly_the_key_subscribers() {
        let state = shared();
        let router = FanoutRouter::new(Arc::clone(&state));

        let (a, mut rx_a) = SubscriberHandle::with_id(1, 4);
        let (b, mut rx_b) = SubscriberHandle::with_id(2, 4);
        let (c, mut rx_c) = SubscriberHandle::with_id(3, 4);
        {
            let mut s = state.write();
            for handle in [&a, &b, &c] {
                s.attach(handle);
            }
            s.streams.add(1, key("btcusdt"));
            s.streams.add(2, key("btcusdt"));
            s.streams.add(3, key("ethusdt"));
        }

        let report = router.publish(&key("btcusdt"), &OutboundFrame::from("tick"));

        assert_eq!(report.delivered, 2);
        assert_eq!(rx_a.recv().await.as_deref(), Some("tick"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("tick"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscriber_added_after_snapshot_misses_that_frame() {
        let state = shared();
        let router = FanoutRouter::new(Arc::clone(&state));

        let (early, mut early_rx) = SubscriberHandle::with_id(1, 4);
        let (late, mut late_rx) = SubscriberHandle::with_id(2, 4);
        {
            let mut s = state.write();
            s.attach(&early);
            s.streams.add(1, key("btcusdt"));
        }

        let snapshot = router.subscribers_of(&key("btcusdt"));
        {
            let mut s = state.write();
            s.attach(&late);
            s.streams.add(2, key("btcusdt"));
        }
        let report =
            FanoutRouter::deliver(DeliveryPath::Raw, &snapshot, &OutboundFrame::from("first"));

        assert_eq!(report.delivered, 1);
        assert_eq!(early_rx.recv().await.as_deref(), Some("first"));
        assert!(late_rx.try_recv().is_err());

        let report = router.publish(&key("btcusdt"), &OutboundFrame::from("second"));
        assert_eq!(report.delivered, 2);
        assert_eq!(early_rx.recv().await.as_deref(), Some("second"));
        assert_eq!(late_rx.recv().await.as_deref(), Some("second"));
    }

    #[test]
    fn publish_without_subscribers_is_empty_report() {
        let router = FanoutRouter::new(shared());

        let report = router.publish(&key("btcusdt"), &OutboundFrame::from("tick"));

        assert_eq!(report, DeliveryReport::default());
    }

    #[test]
    fn closed_subscriber_is_reported_not_removed() {
        let state = shared();
        let router = FanoutRouter::new(Arc::clone(&state));

        let (handle, rx) = SubscriberHandle::with_id(1, 4);
        {
            let mut s = state.write();
            s.attach(&handle);
            s.streams.add(1, key("btcusdt"));
        }
        drop(rx);

        let report = router.publish(&key("btcusdt"), &OutboundFrame::from("tick"));

        assert_eq!(report.closed, 1);
        assert_eq!(state.read().streams.subscriber_count(&key("btcusdt")), 1);
    }

    #[tokio::test]
    async fn summary_is_wrapped_and_routed_by_lowercase_symbol() {
        let state = shared();
        let router = FanoutRouter::new(Arc::clone(&state));

        let (handle, mut rx) = SubscriberHandle::with_id(1, 4);
        {
            let mut s = state.write();
            s.attach(&handle);
            s.summaries.add(1, "btcusdt".to_string());
        }

        let record = SummaryRecord {
            symbol: "BTCUSDT".to_string(),
            last_price: Some(10.0),
            volume: Some(2.0),
            timestamp: 1,
        };

        assert_eq!(router.publish_summary(&record).delivered, 1);

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "summary");
        assert_eq!(value["data"]["symbol"], "BTCUSDT");
        assert_eq!(value["data"]["ts"], 1);
    }
}
