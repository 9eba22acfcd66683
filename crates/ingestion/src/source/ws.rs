use anyhow::{anyhow, Result};
use dexquote_config::SourceConfig;
use dexquote_core_types::{
    CompiledIx, InnerIxGroup, TokenBalance, TransactionRecord, TxMessage, TxMeta, TxVersion,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::queue::OverflowPolicy;
use super::ws_pipeline::ws_stream_loop;
use super::{
    record_is_current, Commitment, ConnectionTracker, RecordQueue, SourcePipeline, SourceSnapshot,
    SourceTelemetry,
};

pub(crate) struct WsRuntimeConfig {
    pub(crate) ws_url: String,
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

/// Implementation β: server-pushed `transactionNotification` frames over a
/// persistent socket, one JSON-RPC subscription per connection.
pub struct WsSource {
    runtime: Arc<WsRuntimeConfig>,
    policy: OverflowPolicy,
    tracker: Arc<ConnectionTracker>,
    telemetry_report_seconds: u64,
    pipeline: Option<SourcePipeline>,
}

impl WsSource {
    pub fn new(config: &SourceConfig, watched: HashSet<String>) -> Result<Self> {
        let ws_url = config.ws_url.trim();
        if ws_url.is_empty() || ws_url.contains("REPLACE_ME") {
            return Err(anyhow!("ws provider requires source.ws_url with a real API key"));
        }

        let runtime = WsRuntimeConfig {
            ws_url: ws_url.to_string(),
            commitment: Commitment::parse(&config.commitment),
            watched,
            connect_timeout_ms: config.connect_timeout_ms.max(1_000),
            reconnect_initial_ms: config.reconnect_initial_ms.max(200),
            reconnect_max_ms: config
                .reconnect_max_ms
                .max(config.reconnect_initial_ms.max(200)),
            ping_interval_secs: config.ws_ping_interval_secs.max(1),
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
                    warn!("ws record queue closed; restarting stream task");
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
                warn!("ws stream task stopped; recreating");
            }
            let queue = Arc::new(RecordQueue::new(self.runtime.queue_capacity));
            let task = {
                let runtime = Arc::clone(&self.runtime);
                let queue = Arc::clone(&queue);
                let tracker = Arc::clone(&self.tracker);
                let policy = self.policy;
                tokio::spawn(async move {
                    ws_stream_loop(runtime, queue, tracker, policy).await;
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

pub(super) fn build_subscribe_request(request_id: u64, runtime: &WsRuntimeConfig) -> String {
    let mut account_include: Vec<String> = runtime.watched.iter().cloned().collect();
    account_include.sort();
    json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "method": "transactionSubscribe",
        "params": [
            {
                "failed": false,
                "accountInclude": account_include
            },
            {
                "commitment": runtime.commitment.as_str(),
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "showRewards": false,
                "maxSupportedTransactionVersion": 0
            }
        ]
    })
    .to_string()
}

pub(super) enum WsFrame {
    SubscribeAck { request_id: u64, subscription_id: u64 },
    Notification(Value),
    RpcError(String),
    Other,
}

pub(super) fn parse_frame(text: &str) -> WsFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            debug!(error = %error, "skipping invalid ws frame json");
            return WsFrame::Other;
        }
    };

    if let Some(error) = value.get("error") {
        return WsFrame::RpcError(error.to_string());
    }

    if let (Some(id), Some(result)) = (value.get("id"), value.get("result")) {
        if let (Some(request_id), Some(subscription_id)) = (id.as_u64(), result.as_u64()) {
            return WsFrame::SubscribeAck {
                request_id,
                subscription_id,
            };
        }
    }

    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return WsFrame::Other;
    };
    if method != "transactionNotification" {
        return WsFrame::Other;
    }
    match value.pointer("/params/result") {
        Some(result) => WsFrame::Notification(result.clone()),
        None => WsFrame::Other,
    }
}

/// Converts one notification result into the normalized record. The frame
/// carries the full jsonParsed transaction, so no follow-up fetch is needed.
pub(super) fn record_from_notification(
    result: &Value,
    connection_id: &str,
) -> Result<Option<TransactionRecord>> {
    let signature = result
        .get("signature")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .or_else(|| {
            result
                .pointer("/transaction/transaction/signatures/0")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .ok_or_else(|| anyhow!("missing signature in notification"))?;
    let slot = result
        .get("slot")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("missing slot in notification"))?;

    let tx = result
        .pointer("/transaction/transaction")
        .ok_or_else(|| anyhow!("missing transaction body in notification"))?;
    let meta = result
        .pointer("/transaction/meta")
        .ok_or_else(|| anyhow!("missing meta in notification"))?;
    let message = tx
        .get("message")
        .ok_or_else(|| anyhow!("missing message in notification"))?;

    let mut account_keys = extract_account_keys(message);
    let loaded_writable = string_array(meta.pointer("/loadedAddresses/writable"));
    let loaded_readonly = string_array(meta.pointer("/loadedAddresses/readonly"));
    let has_loaded_addresses = !loaded_writable.is_empty() || !loaded_readonly.is_empty();
    account_keys.extend(loaded_writable);
    account_keys.extend(loaded_readonly);
    if account_keys.is_empty() {
        return Err(anyhow!("missing account keys in notification"));
    }

    let version = detect_version(
        result.pointer("/transaction/version"),
        message,
        has_loaded_addresses,
    );

    let mut key_index: HashMap<String, usize> = account_keys
        .iter()
        .enumerate()
        .map(|(index, key)| (key.clone(), index))
        .collect();

    let instructions = compiled_instructions(
        message.get("instructions").and_then(Value::as_array),
        &mut account_keys,
        &mut key_index,
    );

    let inner_instructions = meta
        .get("innerInstructions")
        .and_then(Value::as_array)
        .map(|groups| {
            groups
                .iter()
                .filter_map(|group| {
                    let outer_index = group.get("index").and_then(Value::as_u64)? as usize;
                    let instructions = compiled_instructions(
                        group.get("instructions").and_then(Value::as_array),
                        &mut account_keys,
                        &mut key_index,
                    );
                    Some(InnerIxGroup {
                        outer_index,
                        instructions,
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let failed = meta.get("err").map(|err| !err.is_null()).unwrap_or(false);

    Ok(Some(TransactionRecord {
        signature,
        slot,
        message: TxMessage {
            account_keys,
            instructions,
            version,
        },
        meta: TxMeta {
            failed,
            pre_balances: u64_array(meta.get("preBalances")),
            post_balances: u64_array(meta.get("postBalances")),
            pre_token_balances: token_balances(meta.get("preTokenBalances")),
            post_token_balances: token_balances(meta.get("postTokenBalances")),
            inner_instructions,
            log_messages: string_array(meta.get("logMessages")),
        },
        block_time: result.get("blockTime").and_then(Value::as_i64),
        connection_id: connection_id.to_string(),
    }))
}

fn detect_version(version: Option<&Value>, message: &Value, has_loaded_addresses: bool) -> TxVersion {
    match version {
        Some(Value::String(tag)) if tag == "legacy" => TxVersion::Legacy,
        Some(Value::Number(number)) if number.as_u64() == Some(0) => TxVersion::V0,
        _ => {
            let has_lookups = message
                .get("addressTableLookups")
                .and_then(Value::as_array)
                .is_some_and(|lookups| !lookups.is_empty());
            if has_lookups || has_loaded_addresses {
                TxVersion::V0
            } else {
                TxVersion::Legacy
            }
        }
    }
}

/// jsonParsed account keys arrive either as bare strings or as
/// `{pubkey, signer, writable}` objects.
fn extract_account_keys(message: &Value) -> Vec<String> {
    message
        .get("accountKeys")
        .and_then(Value::as_array)
        .map(|keys| {
            keys.iter()
                .filter_map(|item| {
                    if let Some(pubkey) = item.as_str() {
                        return Some(pubkey.to_string());
                    }
                    item.get("pubkey")
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Normalizes instruction JSON into index-based form. Parsed instructions
/// reference accounts by pubkey; unknown pubkeys are appended to the key
/// table so indices always resolve.
fn compiled_instructions(
    instructions: Option<&Vec<Value>>,
    account_keys: &mut Vec<String>,
    key_index: &mut HashMap<String, usize>,
) -> Vec<CompiledIx> {
    let Some(instructions) = instructions else {
        return Vec::new();
    };
    instructions
        .iter()
        .filter_map(|ix| {
            let program_id_index = match ix.get("programIdIndex").and_then(Value::as_u64) {
                Some(index) => index as usize,
                None => {
                    let program_id = ix.get("programId").and_then(Value::as_str)?;
                    intern_key(program_id, account_keys, key_index)
                }
            };
            let accounts = match ix.get("accounts").and_then(Value::as_array) {
                Some(entries) => entries
                    .iter()
                    .filter_map(|entry| {
                        if let Some(index) = entry.as_u64() {
                            return Some(index as usize);
                        }
                        entry
                            .as_str()
                            .map(|pubkey| intern_key(pubkey, account_keys, key_index))
                    })
                    .collect(),
                None => Vec::new(),
            };
            let data = ix
                .get("data")
                .and_then(Value::as_str)
                .and_then(|data| bs58::decode(data).into_vec().ok())
                .unwrap_or_default();
            Some(CompiledIx {
                program_id_index,
                accounts,
                data,
            })
        })
        .collect()
}

fn intern_key(
    pubkey: &str,
    account_keys: &mut Vec<String>,
    key_index: &mut HashMap<String, usize>,
) -> usize {
    if let Some(&index) = key_index.get(pubkey) {
        return index;
    }
    let index = account_keys.len();
    account_keys.push(pubkey.to_string());
    key_index.insert(pubkey.to_string(), index);
    index
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn u64_array(value: Option<&Value>) -> Vec<u64> {
    value
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

fn token_balances(value: Option<&Value>) -> Vec<TokenBalance> {
    value
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let account_index =
                        entry.get("accountIndex").and_then(Value::as_u64)? as usize;
                    let mint = entry.get("mint").and_then(Value::as_str)?.to_string();
                    let owner = entry
                        .get("owner")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let ui = entry.get("uiTokenAmount")?;
                    let amount_raw = ui
                        .get("amount")
                        .and_then(Value::as_str)
                        .and_then(|amount| amount.parse::<u64>().ok())?;
                    let decimals = ui.get("decimals").and_then(Value::as_u64).unwrap_or(0) as u8;
                    Some(TokenBalance {
                        account_index,
                        mint,
                        owner,
                        amount_raw,
                        decimals,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_for_tests() -> WsRuntimeConfig {
        WsRuntimeConfig {
            ws_url: "wss://example".to_string(),
            commitment: Commitment::Confirmed,
            watched: ["ProgramA".to_string()].into_iter().collect(),
            connect_timeout_ms: 30_000,
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 10_000,
            ping_interval_secs: 30,
            idle_timeout_secs: 45,
            queue_capacity: 64,
            seen_signatures_limit: 500,
            seen_signatures_ttl: Duration::from_secs(60),
            telemetry: Arc::new(SourceTelemetry::new()),
        }
    }

    #[test]
    fn subscribe_request_pins_full_parsed_details() {
        let request = build_subscribe_request(7, &runtime_for_tests());
        let value: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(value["method"], "transactionSubscribe");
        assert_eq!(value["id"], 7);
        assert_eq!(value["params"][0]["failed"], false);
        assert_eq!(value["params"][0]["accountInclude"][0], "ProgramA");
        assert_eq!(value["params"][1]["commitment"], "confirmed");
        assert_eq!(value["params"][1]["encoding"], "jsonParsed");
        assert_eq!(value["params"][1]["transactionDetails"], "full");
        assert_eq!(value["params"][1]["showRewards"], false);
        assert_eq!(value["params"][1]["maxSupportedTransactionVersion"], 0);
    }

    #[test]
    fn parse_frame_recognizes_subscribe_ack() {
        let ack = json!({"jsonrpc": "2.0", "id": 42, "result": 99}).to_string();
        match parse_frame(&ack) {
            WsFrame::SubscribeAck {
                request_id,
                subscription_id,
            } => {
                assert_eq!(request_id, 42);
                assert_eq!(subscription_id, 99);
            }
            _ => panic!("expected subscribe ack"),
        }
    }

    #[test]
    fn parse_frame_recognizes_rpc_error() {
        let error =
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "bad params"}})
                .to_string();
        assert!(matches!(parse_frame(&error), WsFrame::RpcError(_)));
    }

    #[test]
    fn parse_frame_ignores_unrelated_methods() {
        let other = json!({"jsonrpc": "2.0", "method": "slotNotification", "params": {}})
            .to_string();
        assert!(matches!(parse_frame(&other), WsFrame::Other));
    }

    fn sample_notification() -> Value {
        json!({
            "signature": "SigBase58",
            "slot": 312_000_777u64,
            "transaction": {
                "transaction": {
                    "message": {
                        "accountKeys": [
                            {"pubkey": "UserWallet", "signer": true},
                            {"pubkey": "PoolAccount", "signer": false},
                            {"pubkey": "ProgramA", "signer": false}
                        ],
                        "instructions": [
                            {"programId": "ProgramA", "accounts": ["UserWallet", "PoolAccount"], "data": "3Bxs43ZMjSRQLs6o"}
                        ]
                    },
                    "signatures": ["SigBase58"]
                },
                "version": 0,
                "meta": {
                    "err": null,
                    "preBalances": [2_000_000_000u64, 0, 0],
                    "postBalances": [1_000_000_000u64, 0, 0],
                    "preTokenBalances": [],
                    "postTokenBalances": [
                        {
                            "accountIndex": 1,
                            "mint": "MintB",
                            "owner": "UserWallet",
                            "uiTokenAmount": {"amount": "500", "decimals": 6, "uiAmountString": "0.0005"}
                        }
                    ],
                    "innerInstructions": [],
                    "logMessages": ["Program ProgramA invoke [1]"],
                    "loadedAddresses": {"writable": ["LoadedW"], "readonly": []}
                }
            }
        })
    }

    #[test]
    fn notification_converts_to_normalized_record() {
        let record = record_from_notification(&sample_notification(), "conn-1")
            .expect("conversion succeeds")
            .expect("record present");
        assert_eq!(record.signature, "SigBase58");
        assert_eq!(record.slot, 312_000_777);
        assert_eq!(record.connection_id, "conn-1");
        assert_eq!(record.message.version, TxVersion::V0);
        assert_eq!(
            record.message.account_keys,
            vec!["UserWallet", "PoolAccount", "ProgramA", "LoadedW"]
        );
        let ix = &record.message.instructions[0];
        assert_eq!(ix.program_id_index, 2);
        assert_eq!(ix.accounts, vec![0, 1]);
        assert!(!ix.data.is_empty(), "base58 instruction data decoded");
        assert!(!record.meta.failed);
        assert_eq!(record.meta.post_token_balances[0].amount_raw, 500);
        assert_eq!(record.signer(), Some("UserWallet"));
    }

    #[test]
    fn legacy_tag_yields_legacy_version() {
        let mut notification = sample_notification();
        notification["transaction"]["version"] = json!("legacy");
        notification["transaction"]["meta"]["loadedAddresses"] =
            json!({"writable": [], "readonly": []});
        let record = record_from_notification(&notification, "conn")
            .unwrap()
            .unwrap();
        assert_eq!(record.message.version, TxVersion::Legacy);
    }

    #[test]
    fn failed_transactions_keep_error_flag() {
        let mut notification = sample_notification();
        notification["transaction"]["meta"]["err"] =
            json!({"InstructionError": [0, "Custom"]});
        let record = record_from_notification(&notification, "conn")
            .unwrap()
            .unwrap();
        assert!(record.meta.failed);
    }
}
