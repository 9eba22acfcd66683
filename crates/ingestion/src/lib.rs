mod extract;
mod source;
mod validate;

pub use extract::{ExtractOutcome, TradeExtractor};
pub use source::{SourceSnapshot, StreamSource};
pub use validate::{RejectReason, TradeValidator};

use anyhow::Result;
use dexquote_config::SourceConfig;
use dexquote_core_types::{PriceObservation, TransactionRecord};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Ingestion front door: one streaming source plus the extraction and
/// validation stages that reduce raw transactions to price observations.
pub struct IngestionService {
    source: StreamSource,
    extractor: TradeExtractor,
    validator: TradeValidator,
    rejections: AtomicU64,
}

impl IngestionService {
    /// `whitelist` is the builder registry's supported program set; it gates
    /// both the subscription filter and trade admission.
    pub fn build(config: &SourceConfig, whitelist: HashSet<String>) -> Result<Self> {
        let watched: HashSet<String> = if config.watch_program_ids.is_empty() {
            whitelist.clone()
        } else {
            config.watch_program_ids.iter().cloned().collect()
        };
        let source = StreamSource::from_config(config, watched)?;
        Ok(Self {
            source,
            extractor: TradeExtractor::new(whitelist.clone()),
            validator: TradeValidator::new(whitelist),
            rejections: AtomicU64::new(0),
        })
    }

    /// Next raw transaction record, in source order. `None` means the source
    /// is permanently closed (shutdown).
    pub async fn next_record(&mut self) -> Result<Option<TransactionRecord>> {
        self.source.next_record().await
    }

    /// Runs one record through extraction and validation. Rejections are
    /// counted and logged at debug level, never propagated.
    pub fn process(&self, record: &TransactionRecord) -> Vec<PriceObservation> {
        let outcome = self.extractor.extract(record);
        let (observations, rejections) =
            self.validator
                .validate_all(&outcome.trades, &outcome.curve_events, record);
        self.rejections
            .fetch_add(rejections.len() as u64, Ordering::Relaxed);
        for reason in &rejections {
            debug!(signature = %record.signature, reason = %reason, "trade candidate rejected");
        }
        observations
    }

    pub fn rejection_count(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        self.source.snapshot()
    }

    /// Aborts the stream task and closes the hand-off queue.
    pub fn shutdown(&mut self) {
        self.source.shutdown();
    }
}
