//! Summary Projector
//!
//! Turns decoded upstream payloads into [`SummaryRecord`]s, publishes them to
//! summary subscribers, then queues a cache write. The cache write never
//! blocks or fails the publish step.

use chrono::Utc;
use serde_json::Value;

use super::router::FanoutRouter;
use crate::domain::summary::{FeedMessage, SummaryRecord};
use crate::infrastructure::cache::CacheWriter;
use crate::infrastructure::metrics;

/// Projects payloads to summaries and distributes them.
#[derive(Debug, Clone)]
pub struct SummaryProjector {
    router: FanoutRouter,
    cache: CacheWriter,
}

impl SummaryProjector {
    /// Create a projector.
    #[must_use]
    pub const fn new(router: FanoutRouter, cache: CacheWriter) -> Self {
        Self { router, cache }
    }

    /// Project one payload. Returns the record if one was produced.
    pub fn handle(&self, payload: &Value) -> Option<SummaryRecord> {
        let message = FeedMessage::classify(payload);
        let kind = message.kind();
        let record = message.into_record(Utc::now().timestamp_millis())?;

        metrics::record_projection(kind);

        let report = self.router.publish_summary(&record);
        tracing::trace!(
            symbol = %record.symbol,
            kind,
            delivered = report.delivered,
            "Summary published"
        );

        self.cache.enqueue(&record);
        Some(record)
    }
}
