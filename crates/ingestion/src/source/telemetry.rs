use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::info;

/// Ingestion counters. Writes are relaxed atomic increments; readers tolerate
/// torn cross-counter views, which is fine for monitoring.
#[derive(Debug)]
pub(crate) struct SourceTelemetry {
    transactions_received: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    duplicates_dropped: AtomicU64,
    stale_connection_dropped: AtomicU64,
    queue_backpressured: AtomicU64,
    queue_replaced_oldest: AtomicU64,
    started_at: DateTime<Utc>,
    last_report_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub transactions_received: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub duplicates_dropped: u64,
    pub stale_connection_dropped: u64,
    pub started_at: DateTime<Utc>,
    pub connection_id: Option<String>,
    pub connection_state: &'static str,
}

impl SourceTelemetry {
    pub(crate) fn new() -> Self {
        Self {
            transactions_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            stale_connection_dropped: AtomicU64::new(0),
            queue_backpressured: AtomicU64::new(0),
            queue_replaced_oldest: AtomicU64::new(0),
            started_at: Utc::now(),
            last_report_ms: AtomicI64::new(0),
        }
    }

    pub(crate) fn note_transaction_received(&self) {
        self.transactions_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_duplicate_drop(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_stale_connection_drop(&self) {
        self.stale_connection_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_queue_backpressured(&self) {
        self.queue_backpressured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_queue_replaced_oldest(&self) {
        self.queue_replaced_oldest.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        connection_id: Option<String>,
        connection_state: &'static str,
    ) -> SourceSnapshot {
        SourceSnapshot {
            transactions_received: self.transactions_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            stale_connection_dropped: self.stale_connection_dropped.load(Ordering::Relaxed),
            started_at: self.started_at,
            connection_id,
            connection_state,
        }
    }

    /// Emits at most one structured metrics line per report window. The CAS
    /// keeps concurrent callers from double-reporting.
    pub(crate) fn maybe_report(&self, report_seconds: u64, queue_depth: usize) {
        let report_seconds = report_seconds.max(5);
        let now_ms = Utc::now().timestamp_millis();
        let last = self.last_report_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < (report_seconds as i64 * 1_000) {
            return;
        }
        if self
            .last_report_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!(
            transactions_received = self.transactions_received.load(Ordering::Relaxed),
            errors = self.errors.load(Ordering::Relaxed),
            reconnects = self.reconnects.load(Ordering::Relaxed),
            duplicates_dropped = self.duplicates_dropped.load(Ordering::Relaxed),
            stale_connection_dropped = self.stale_connection_dropped.load(Ordering::Relaxed),
            queue_backpressured = self.queue_backpressured.load(Ordering::Relaxed),
            queue_replaced_oldest = self.queue_replaced_oldest.load(Ordering::Relaxed),
            queue_depth,
            "transaction source metrics"
        );
    }
}
