mod grpc;
mod grpc_pipeline;
mod queue;
mod telemetry;
mod ws;
mod ws_pipeline;

use anyhow::{anyhow, Result};
use chrono::Utc;
use dexquote_config::SourceConfig;
use dexquote_core_types::{
    CompiledIx, TokenBalance, TransactionRecord, TxMessage, TxMeta, TxVersion, WSOL_MINT,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval};
use tracing::warn;
use uuid::Uuid;

use queue::BoundedQueue;
pub(crate) use telemetry::SourceTelemetry;
pub use telemetry::SourceSnapshot;

pub(crate) type RecordQueue = BoundedQueue<TransactionRecord>;

/// Connection lifecycle owned by the stream task. Reconnection is driven by
/// that task alone; consumers only observe the current state and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Running,
    Reconnecting,
}

impl ConnectionState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug)]
pub(crate) struct ConnectionTracker {
    inner: Mutex<(String, ConnectionState)>,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new((String::new(), ConnectionState::Disconnected)),
        }
    }

    /// Enters CONNECTING with a fresh connection id and returns it. Records
    /// stamped with an older id are dropped by the consumer from here on.
    pub(crate) fn begin_connecting(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut guard = self.inner.lock().expect("connection tracker poisoned");
        guard.0 = id.clone();
        guard.1 = ConnectionState::Connecting;
        id
    }

    pub(crate) fn set_running(&self) {
        let mut guard = self.inner.lock().expect("connection tracker poisoned");
        guard.1 = ConnectionState::Running;
    }

    /// Connection dropped: the id is cleared so in-flight records from the
    /// torn-down subscription cannot be mistaken for current ones.
    pub(crate) fn set_reconnecting(&self) {
        let mut guard = self.inner.lock().expect("connection tracker poisoned");
        guard.0.clear();
        guard.1 = ConnectionState::Reconnecting;
    }

    pub(crate) fn current_id(&self) -> Option<String> {
        let guard = self.inner.lock().expect("connection tracker poisoned");
        if guard.0.is_empty() {
            None
        } else {
            Some(guard.0.clone())
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.inner.lock().expect("connection tracker poisoned").1
    }
}

/// Recently seen signatures, capped and TTL-bounded, for duplicate
/// suppression across subscription restarts.
pub(crate) struct SeenSignatures {
    map: HashMap<String, Instant>,
    queue: VecDeque<(String, Instant)>,
    limit: usize,
    ttl: Duration,
}

impl SeenSignatures {
    pub(crate) fn new(limit: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            queue: VecDeque::new(),
            limit: limit.max(16),
            ttl,
        }
    }

    /// Returns true when the signature was already seen inside the TTL
    /// window; marks it seen otherwise.
    pub(crate) fn check_and_mark(&mut self, signature: &str, now: Instant) -> bool {
        self.prune(now);
        if self
            .map
            .get(signature)
            .is_some_and(|seen_at| now.duration_since(*seen_at) < self.ttl)
        {
            return true;
        }
        self.map.insert(signature.to_string(), now);
        self.queue.push_back((signature.to_string(), now));
        false
    }

    fn prune(&mut self, now: Instant) {
        while let Some((signature, seen_at)) = self.queue.front() {
            let expired = now.duration_since(*seen_at) >= self.ttl;
            if !expired && self.queue.len() <= self.limit {
                break;
            }
            if self
                .map
                .get(signature)
                .is_some_and(|current| current == seen_at)
            {
                self.map.remove(signature);
            }
            self.queue.pop_front();
        }
    }
}

pub(crate) async fn sleep_with_backoff(next_backoff_ms: &mut u64, initial_ms: u64, max_ms: u64) {
    let delay = (*next_backoff_ms).clamp(initial_ms, max_ms);
    time::sleep(Duration::from_millis(delay)).await;
    *next_backoff_ms = delay.saturating_mul(2).min(max_ms);
}

/// One live subscription: the stream task plus the record hand-off queue.
/// Dropping it aborts the task, detaching every listener in one stroke.
pub(crate) struct SourcePipeline {
    pub(crate) queue: Arc<RecordQueue>,
    pub(crate) task: JoinHandle<()>,
}

impl Drop for SourcePipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub enum StreamSource {
    Mock(MockSource),
    Grpc(grpc::GrpcSource),
    Ws(ws::WsSource),
}

impl StreamSource {
    pub fn from_config(config: &SourceConfig, watched: HashSet<String>) -> Result<Self> {
        if watched.is_empty() {
            return Err(anyhow!("streaming source requires at least one watched program id"));
        }
        match config.provider.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock(MockSource::new(
                config.mock_interval_ms,
                watched.iter().next().cloned().unwrap_or_default(),
            ))),
            "grpc" => Ok(Self::Grpc(grpc::GrpcSource::new(config, watched)?)),
            "ws" => Ok(Self::Ws(ws::WsSource::new(config, watched)?)),
            other => Err(anyhow!("unknown source.provider: {other}")),
        }
    }

    pub async fn next_record(&mut self) -> Result<Option<TransactionRecord>> {
        match self {
            Self::Mock(source) => source.next_record().await,
            Self::Grpc(source) => source.next_record().await,
            Self::Ws(source) => source.next_record().await,
        }
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        match self {
            Self::Mock(source) => source.telemetry.snapshot(None, "running"),
            Self::Grpc(source) => source.snapshot(),
            Self::Ws(source) => source.snapshot(),
        }
    }

    pub fn shutdown(&mut self) {
        match self {
            Self::Mock(_) => {}
            Self::Grpc(source) => source.shutdown(),
            Self::Ws(source) => source.shutdown(),
        }
    }
}

/// Drops records stamped with a connection id other than the current one.
/// Suppresses the race where a replaced subscription still has frames in the
/// hand-off queue.
pub(crate) fn record_is_current(
    record: &TransactionRecord,
    tracker: &ConnectionTracker,
    telemetry: &SourceTelemetry,
) -> bool {
    let current = tracker.current_id();
    if current.as_deref() == Some(record.connection_id.as_str()) {
        return true;
    }
    telemetry.note_stale_connection_drop();
    warn!(
        signature = %record.signature,
        record_connection = %record.connection_id,
        "dropping record from replaced subscription"
    );
    false
}

/// Synthetic record generator for offline runs and tests.
pub struct MockSource {
    interval: Interval,
    sequence: u64,
    session_tag: String,
    program_id: String,
    connection_id: String,
    pub(crate) telemetry: Arc<SourceTelemetry>,
}

impl MockSource {
    pub fn new(interval_ms: u64, program_id: String) -> Self {
        let session_tag = format!("{}-{}", Utc::now().timestamp_millis(), std::process::id());
        Self {
            interval: time::interval(Duration::from_millis(interval_ms.max(100))),
            sequence: 0,
            session_tag,
            program_id,
            connection_id: Uuid::new_v4().to_string(),
            telemetry: Arc::new(SourceTelemetry::new()),
        }
    }

    async fn next_record(&mut self) -> Result<Option<TransactionRecord>> {
        self.interval.tick().await;
        self.sequence = self.sequence.saturating_add(1);
        let n = self.sequence;
        self.telemetry.note_transaction_received();

        let mint = format!("MockMint{n}");
        Ok(Some(TransactionRecord {
            signature: format!("mock-{}-sig-{n}", self.session_tag),
            slot: 1_000_000 + n,
            message: TxMessage {
                account_keys: vec![
                    "MockUserWallet111111111111111111111111111111".to_string(),
                    format!("MockPool{n}"),
                    self.program_id.clone(),
                ],
                // account list sized so every protocol's pool slot resolves
                instructions: vec![CompiledIx {
                    program_id_index: 2,
                    accounts: vec![1, 1, 0, 1],
                    data: Vec::new(),
                }],
                version: TxVersion::Legacy,
            },
            meta: TxMeta {
                failed: false,
                pre_balances: vec![2_000_000_000, 0, 0],
                post_balances: vec![1_000_000_000, 0, 0],
                pre_token_balances: vec![TokenBalance {
                    account_index: 0,
                    mint: WSOL_MINT.to_string(),
                    owner: "MockUserWallet111111111111111111111111111111".to_string(),
                    amount_raw: 1_000_000_000,
                    decimals: 9,
                }],
                post_token_balances: vec![
                    TokenBalance {
                        account_index: 0,
                        mint: WSOL_MINT.to_string(),
                        owner: "MockUserWallet111111111111111111111111111111".to_string(),
                        amount_raw: 0,
                        decimals: 9,
                    },
                    TokenBalance {
                        account_index: 0,
                        mint: mint.clone(),
                        owner: "MockUserWallet111111111111111111111111111111".to_string(),
                        amount_raw: 500_000 + n,
                        decimals: 6,
                    },
                ],
                inner_instructions: Vec::new(),
                log_messages: Vec::new(),
            },
            block_time: Some(Utc::now().timestamp()),
            connection_id: self.connection_id.clone(),
        }))
    }
}

/// Commitment tier shared by both providers; parse failures fall back to
/// confirmed, matching the production default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    pub(crate) fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "processed" => Self::Processed,
            "finalized" => Self::Finalized,
            _ => Self::Confirmed,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Confirmed => "confirmed",
            Self::Finalized => "finalized",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_clears_id_on_reconnect() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
        let id = tracker.begin_connecting();
        assert_eq!(tracker.current_id().as_deref(), Some(id.as_str()));
        tracker.set_running();
        assert_eq!(tracker.state(), ConnectionState::Running);
        tracker.set_reconnecting();
        assert_eq!(tracker.current_id(), None);
        assert_eq!(tracker.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn fresh_connection_id_per_attempt() {
        let tracker = ConnectionTracker::new();
        let first = tracker.begin_connecting();
        let second = tracker.begin_connecting();
        assert_ne!(first, second);
    }

    #[test]
    fn seen_signatures_suppress_duplicates_within_ttl() {
        let mut seen = SeenSignatures::new(100, Duration::from_secs(60));
        let now = Instant::now();
        assert!(!seen.check_and_mark("sig-a", now));
        assert!(seen.check_and_mark("sig-a", now));
        assert!(!seen.check_and_mark("sig-b", now));
    }

    #[test]
    fn seen_signatures_expire_after_ttl() {
        let mut seen = SeenSignatures::new(100, Duration::from_millis(10));
        let now = Instant::now();
        assert!(!seen.check_and_mark("sig-a", now));
        let later = now + Duration::from_millis(20);
        assert!(!seen.check_and_mark("sig-a", later));
    }

    #[test]
    fn commitment_parse_defaults_to_confirmed() {
        assert_eq!(Commitment::parse("processed"), Commitment::Processed);
        assert_eq!(Commitment::parse("FINALIZED"), Commitment::Finalized);
        assert_eq!(Commitment::parse("bogus"), Commitment::Confirmed);
    }
}
