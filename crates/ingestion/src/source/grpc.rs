use anyhow::{anyhow, Result};
use dexquote_config::SourceConfig;
use dexquote_core_types::{
    CompiledIx, InnerIxGroup, TokenBalance, TransactionRecord, TxMessage, TxMeta, TxVersion,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use yellowstone_grpc_proto::prelude::{
    CommitmentLevel, Message as ProtoMessage, SubscribeRequest,
    SubscribeRequestFilterTransactions, SubscribeUpdateTransaction,
    SubscribeUpdateTransactionInfo, TransactionStatusMeta,
};

use super::grpc_pipeline::grpc_stream_loop;
use super::queue::OverflowPolicy;
use super::{
    record_is_current, Commitment, ConnectionTracker, RecordQueue, SourcePipeline, SourceSnapshot,
    SourceTelemetry,
};

pub(crate) struct GrpcRuntimeConfig {
    pub(crate) grpc_url: String,
    pub(crate) x_token: String,
    pub(crate) commitment: Commitment,
    pub(crate) watched: HashSet<String>,
    pub(crate) connect_timeout_ms: u64,
    pub(crate) reconnect_initial_ms: u64,
    pub(crate) reconnect_max_ms: u64,
    pub(crate) ping_interval_secs: u64,
    pub(crate) idle_timeout_secs: u64,
    pub(crate) queue_capacity: usize,
    pub(crate) seen_signatures_limit: usize,
    pub(crate) seen_signatures_ttl: Duration,
    pub(crate) telemetry: Arc<SourceTelemetry>,
}

/// Implementation α: one long-lived bidirectional gRPC stream with
/// client-driven keepalive pings.
pub struct GrpcSource {
    runtime: Arc<GrpcRuntimeConfig>,
    policy: OverflowPolicy,
    tracker: Arc<ConnectionTracker>,
    telemetry_report_seconds: u64,
    pipeline: Option<SourcePipeline>,
}

impl GrpcSource {
    pub fn new(config: &SourceConfig, watched: HashSet<String>) -> Result<Self> {
        let grpc_url = config.grpc_url.trim();
        if grpc_url.is_empty()
            || grpc_url.contains("REPLACE_ME")
            || !(grpc_url.starts_with("http://") || grpc_url.starts_with("https://"))
        {
            return Err(anyhow!(
                "grpc provider requires source.grpc_url with an explicit http(s):// endpoint"
            ));
        }
        let x_token = config.grpc_x_token.trim();
        if x_token.is_empty() || x_token.contains("REPLACE_ME") {
            return Err(anyhow!("grpc provider requires source.grpc_x_token"));
        }

        let runtime = GrpcRuntimeConfig {
            grpc_url: grpc_url.to_string(),
            x_token: x_token.to_string(),
            commitment: Commitment::parse(&config.commitment),
            watched,
            connect_timeout_ms: config.connect_timeout_ms.max(1_000),
            reconnect_initial_ms: config.reconnect_initial_ms.max(200),
            reconnect_max_ms: config
                .reconnect_max_ms
                .max(config.reconnect_initial_ms.max(200)),
            ping_interval_secs: config.grpc_ping_interval_secs.max(1),
            idle_timeout_secs: config.idle_timeout_secs.max(10),
            queue_capacity: config.queue_capacity.max(64),
            seen_signatures_limit: config.seen_signatures_limit.max(500),
            seen_signatures_ttl: Duration::from_millis(config.seen_signatures_ttl_ms.max(1_000)),
            telemetry: Arc::new(SourceTelemetry::new()),
        };

        Ok(Self {
            runtime: Arc::new(runtime),
            policy: OverflowPolicy::parse(&config.queue_overflow_policy),
            tracker: Arc::new(ConnectionTracker::new()),
            telemetry_report_seconds: config.telemetry_report_seconds.max(5),
            pipeline: None,
        })
    }

    pub(super) async fn next_record(&mut self) -> Result<Option<TransactionRecord>> {
        loop {
            self.ensure_pipeline_running();
            let Some(pipeline) = self.pipeline.as_ref() else {
                return Ok(None);
            };

            match pipeline.queue.pop().await {
                Some(record) => {
                    if !record_is_current(&record, &self.tracker, &self.runtime.telemetry) {
                        continue;
                    }
                    self.runtime.telemetry.note_transaction_received();
                    self.runtime
                        .telemetry
                        .maybe_report(self.telemetry_report_seconds, 0);
                    return Ok(Some(record));
                }
                None => {
                    warn!("grpc record queue closed; restarting stream task");
                    self.pipeline = None;
                }
            }
        }
    }

    fn ensure_pipeline_running(&mut self) {
        let needs_restart = self
            .pipeline
            .as_ref()
            .map(|pipeline| pipeline.task.is_finished())
            .unwrap_or(true);
        if needs_restart {
            if self.pipeline.is_some() {
                warn!("grpc stream task stopped; recreating");
            }
            let queue = Arc::new(RecordQueue::new(self.runtime.queue_capacity));
            let task = {
                let runtime = Arc::clone(&self.runtime);
                let queue = Arc::clone(&queue);
                let tracker = Arc::clone(&self.tracker);
                let policy = self.policy;
                tokio::spawn(async move {
                    grpc_stream_loop(runtime, queue, tracker, policy).await;
                })
            };
            self.pipeline = Some(SourcePipeline { queue, task });
        }
    }

    pub(super) fn snapshot(&self) -> SourceSnapshot {
        self.runtime
            .telemetry
            .snapshot(self.tracker.current_id(), self.tracker.state().as_str())
    }

    pub(super) fn shutdown(&mut self) {
        self.pipeline = None;
    }
}

pub(super) fn build_subscribe_request(runtime: &GrpcRuntimeConfig) -> SubscribeRequest {
    let mut transactions = HashMap::new();
    transactions.insert(
        "dexquote-swaps".to_string(),
        SubscribeRequestFilterTransactions {
            vote: Some(false),
            failed: Some(false),
            signature: None,
            account_include: runtime.watched.iter().cloned().collect(),
            account_exclude: Vec::new(),
            account_required: Vec::new(),
        },
    );

    let commitment = match runtime.commitment {
        Commitment::Processed => CommitmentLevel::Processed,
        Commitment::Confirmed => CommitmentLevel::Confirmed,
        Commitment::Finalized => CommitmentLevel::Finalized,
    };

    SubscribeRequest {
        accounts: HashMap::new(),
        slots: HashMap::new(),
        transactions,
        transactions_status: HashMap::new(),
        blocks: HashMap::new(),
        blocks_meta: HashMap::new(),
        entry: HashMap::new(),
        commitment: Some(commitment as i32),
        accounts_data_slice: Vec::new(),
        ping: None,
        from_slot: None,
    }
}

/// Converts one pushed transaction update into the normalized record handed
/// to the extractor. `Ok(None)` drops vote transactions.
pub(super) fn record_from_update(
    tx_update: SubscribeUpdateTransaction,
    created_at_secs: Option<i64>,
    connection_id: &str,
) -> Result<Option<TransactionRecord>> {
    if tx_update.slot == 0 {
        return Err(anyhow!("missing slot in transaction update"));
    }
    let Some(tx_info) = tx_update.transaction else {
        return Err(anyhow!("missing transaction info in update"));
    };
    if tx_info.is_vote {
        return Ok(None);
    }

    let Some(meta) = tx_info.meta.as_ref() else {
        return Err(anyhow!("missing meta in transaction update"));
    };
    let Some(transaction) = tx_info.transaction.as_ref() else {
        return Err(anyhow!("missing transaction body in update"));
    };
    let Some(message) = transaction.message.as_ref() else {
        return Err(anyhow!("missing message in transaction update"));
    };

    let signature = decode_signature(&tx_info)
        .ok_or_else(|| anyhow!("missing signature in transaction update"))?;

    let account_keys = resolve_account_keys(message, meta);
    if account_keys.is_empty() {
        return Err(anyhow!("missing account keys in transaction update"));
    }

    let version = detect_version(message, meta);
    let instructions = message
        .instructions
        .iter()
        .map(|ix| CompiledIx {
            program_id_index: ix.program_id_index as usize,
            accounts: ix.accounts.iter().map(|&index| index as usize).collect(),
            data: ix.data.clone(),
        })
        .collect();

    let inner_instructions = meta
        .inner_instructions
        .iter()
        .map(|group| InnerIxGroup {
            outer_index: group.index as usize,
            instructions: group
                .instructions
                .iter()
                .map(|ix| CompiledIx {
                    program_id_index: ix.program_id_index as usize,
                    accounts: ix.accounts.iter().map(|&index| index as usize).collect(),
                    data: ix.data.clone(),
                })
                .collect(),
        })
        .collect();

    let failed = meta.err.as_ref().is_some_and(|err| !err.err.is_empty());

    Ok(Some(TransactionRecord {
        signature,
        slot: tx_update.slot,
        message: TxMessage {
            account_keys,
            instructions,
            version,
        },
        meta: TxMeta {
            failed,
            pre_balances: meta.pre_balances.clone(),
            post_balances: meta.post_balances.clone(),
            pre_token_balances: convert_token_balances(&meta.pre_token_balances),
            post_token_balances: convert_token_balances(&meta.post_token_balances),
            inner_instructions,
            log_messages: meta.log_messages.clone(),
        },
        block_time: created_at_secs,
        connection_id: connection_id.to_string(),
    }))
}

fn detect_version(message: &ProtoMessage, meta: &TransactionStatusMeta) -> TxVersion {
    if message.versioned
        || !message.address_table_lookups.is_empty()
        || !meta.loaded_writable_addresses.is_empty()
        || !meta.loaded_readonly_addresses.is_empty()
    {
        TxVersion::V0
    } else {
        TxVersion::Legacy
    }
}

fn decode_signature(tx_info: &SubscribeUpdateTransactionInfo) -> Option<String> {
    if !tx_info.signature.is_empty() {
        return Some(bs58::encode(&tx_info.signature).into_string());
    }
    tx_info
        .transaction
        .as_ref()
        .and_then(|tx| tx.signatures.first())
        .map(|sig| bs58::encode(sig).into_string())
}

/// Static keys followed by loaded writable then readonly lookup addresses;
/// instruction indices resolve against this combined table.
fn resolve_account_keys(message: &ProtoMessage, meta: &TransactionStatusMeta) -> Vec<String> {
    let mut out = message
        .account_keys
        .iter()
        .map(|raw| bs58::encode(raw).into_string())
        .collect::<Vec<_>>();
    out.extend(
        meta.loaded_writable_addresses
            .iter()
            .map(|raw| bs58::encode(raw).into_string()),
    );
    out.extend(
        meta.loaded_readonly_addresses
            .iter()
            .map(|raw| bs58::encode(raw).into_string()),
    );
    out
}

fn convert_token_balances(
    balances: &[yellowstone_grpc_proto::prelude::TokenBalance],
) -> Vec<TokenBalance> {
    balances
        .iter()
        .filter_map(|balance| {
            let ui = balance.ui_token_amount.as_ref()?;
            let amount_raw = ui.amount.parse::<u64>().ok()?;
            Some(TokenBalance {
                account_index: balance.account_index as usize,
                mint: balance.mint.clone(),
                owner: balance.owner.clone(),
                amount_raw,
                decimals: ui.decimals as u8,
            })
        })
        .collect()
}
