use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dexquote_core_types::{
    CompiledIx, CurveEvent, TradeCandidate, TradeSide, TransactionRecord, PUMP_FUN_PROGRAM,
    PUMP_SWAP_PROGRAM, RAYDIUM_V4_PROGRAM, WSOL_MINT,
};
use std::collections::HashSet;
use tracing::debug;

/// Launchpad creation events logged as `Program data:` lines; the payload is
/// base64 borsh with an 8-byte discriminator.
const CURVE_CREATE_DISCRIMINATOR: [u8; 8] = [27, 114, 169, 77, 222, 235, 99, 118];

const LOG_DATA_PREFIX: &str = "Program data: ";

/// Lamport moves below this are fee noise, not a swap leg.
const LAMPORT_DUST: i128 = 1_000_000;

#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub trades: Vec<TradeCandidate>,
    pub curve_events: Vec<CurveEvent>,
    pub total_trades: usize,
}

/// Reduces a raw transaction record to trade candidates plus any
/// bonding-curve events found in the logs.
pub struct TradeExtractor {
    whitelist: HashSet<String>,
}

#[derive(Debug)]
struct SwapLegs {
    side: TradeSide,
    input_mint: Option<String>,
    output_mint: Option<String>,
    input_amount_raw: u64,
    output_amount_raw: u64,
}

impl TradeExtractor {
    pub fn new(whitelist: HashSet<String>) -> Self {
        Self { whitelist }
    }

    /// Fault barrier: a record the decoder cannot handle yields an empty
    /// outcome, never an error. Decoder diagnostics stay at debug level.
    pub fn extract(&self, record: &TransactionRecord) -> ExtractOutcome {
        if record.meta.failed {
            return ExtractOutcome::default();
        }
        match self.decode(record) {
            Ok((trades, curve_events)) => ExtractOutcome {
                total_trades: trades.len(),
                trades,
                curve_events,
            },
            Err(error) => {
                debug!(signature = %record.signature, error = %error, "trade decode failed");
                ExtractOutcome::default()
            }
        }
    }

    fn decode(
        &self,
        record: &TransactionRecord,
    ) -> Result<(Vec<TradeCandidate>, Vec<CurveEvent>)> {
        let signer = record
            .signer()
            .ok_or_else(|| anyhow!("transaction has no account keys"))?
            .to_string();

        let legs = swap_legs_for_signer(record, &signer);
        let mut trades = Vec::new();

        for (index, ix) in record.message.instructions.iter().enumerate() {
            if let Some(candidate) = self.candidate_from_instruction(record, index, ix, &signer, &legs)
            {
                trades.push(candidate);
            }
        }
        for group in &record.meta.inner_instructions {
            for ix in &group.instructions {
                if let Some(candidate) =
                    self.candidate_from_instruction(record, group.outer_index, ix, &signer, &legs)
                {
                    trades.push(candidate);
                }
            }
        }

        let curve_events = decode_curve_events(record);
        Ok((trades, curve_events))
    }

    fn candidate_from_instruction(
        &self,
        record: &TransactionRecord,
        instruction_index: usize,
        ix: &CompiledIx,
        signer: &str,
        legs: &SwapLegs,
    ) -> Option<TradeCandidate> {
        let program_id = record.resolve_account(ix.program_id_index)?;
        if !self.whitelist.contains(program_id) {
            return None;
        }
        let pool = pool_account(program_id, ix, record);
        Some(TradeCandidate {
            side: legs.side,
            input_mint: legs.input_mint.clone(),
            output_mint: legs.output_mint.clone(),
            input_amount_raw: legs.input_amount_raw,
            output_amount_raw: legs.output_amount_raw,
            program_id: Some(program_id.to_string()),
            pool,
            signature: record.signature.clone(),
            slot: record.slot,
            instruction_index: Some(instruction_index),
            user: Some(signer.to_string()),
        })
    }
}

/// Infers the swap legs from the signer's balance deltas, in raw units.
/// The WSOL leg prefers the token-account delta; the lamport delta stands in
/// when the wallet swapped native SOL without a WSOL account.
fn swap_legs_for_signer(record: &TransactionRecord, signer: &str) -> SwapLegs {
    let mut deltas: Vec<(String, i128)> = Vec::new();
    let mut add = |mint: &str, amount: i128| {
        match deltas.iter_mut().find(|(existing, _)| existing == mint) {
            Some((_, total)) => *total += amount,
            None => deltas.push((mint.to_string(), amount)),
        }
    };
    for balance in &record.meta.pre_token_balances {
        if balance.owner == signer {
            add(&balance.mint, -(balance.amount_raw as i128));
        }
    }
    for balance in &record.meta.post_token_balances {
        if balance.owner == signer {
            add(&balance.mint, balance.amount_raw as i128);
        }
    }

    let wsol_delta = deltas
        .iter()
        .find(|(mint, _)| mint == WSOL_MINT)
        .map(|(_, delta)| *delta)
        .unwrap_or(0);
    let lamport_delta = match (
        record.meta.post_balances.first(),
        record.meta.pre_balances.first(),
    ) {
        (Some(&post), Some(&pre)) => post as i128 - pre as i128,
        _ => 0,
    };

    let mut spent: Vec<(String, u64)> = deltas
        .iter()
        .filter(|(mint, delta)| mint != WSOL_MINT && *delta < 0)
        .map(|(mint, delta)| (mint.clone(), delta.unsigned_abs() as u64))
        .collect();
    let mut received: Vec<(String, u64)> = deltas
        .iter()
        .filter(|(mint, delta)| mint != WSOL_MINT && *delta > 0)
        .map(|(mint, delta)| (mint.clone(), *delta as u64))
        .collect();
    spent.sort_by(|a, b| b.1.cmp(&a.1));
    received.sort_by(|a, b| b.1.cmp(&a.1));

    if wsol_delta < 0 || (wsol_delta == 0 && lamport_delta < -LAMPORT_DUST) {
        let wsol_spent = if wsol_delta < 0 {
            wsol_delta.unsigned_abs() as u64
        } else {
            lamport_delta.unsigned_abs() as u64
        };
        let (output_mint, output_amount_raw) = received
            .first()
            .cloned()
            .map(|(mint, amount)| (Some(mint), amount))
            .unwrap_or((None, 0));
        return SwapLegs {
            side: TradeSide::Buy,
            input_mint: Some(WSOL_MINT.to_string()),
            output_mint,
            input_amount_raw: wsol_spent,
            output_amount_raw,
        };
    }
    if wsol_delta > 0 || lamport_delta > LAMPORT_DUST {
        let wsol_received = if wsol_delta > 0 {
            wsol_delta as u64
        } else {
            lamport_delta as u64
        };
        let (input_mint, input_amount_raw) = spent
            .first()
            .cloned()
            .map(|(mint, amount)| (Some(mint), amount))
            .unwrap_or((None, 0));
        return SwapLegs {
            side: TradeSide::Sell,
            input_mint,
            output_mint: Some(WSOL_MINT.to_string()),
            input_amount_raw,
            output_amount_raw: wsol_received,
        };
    }

    // No quote-side movement: treat the dominant legs as a buy-shaped pair
    // and let validation decide.
    let (input_mint, input_amount_raw) = spent
        .first()
        .cloned()
        .map(|(mint, amount)| (Some(mint), amount))
        .unwrap_or((None, 0));
    let (output_mint, output_amount_raw) = received
        .first()
        .cloned()
        .map(|(mint, amount)| (Some(mint), amount))
        .unwrap_or((None, 0));
    SwapLegs {
        side: TradeSide::Buy,
        input_mint,
        output_mint,
        input_amount_raw,
        output_amount_raw,
    }
}

/// Pool account position inside the swap instruction, per protocol.
fn pool_account(program_id: &str, ix: &CompiledIx, record: &TransactionRecord) -> Option<String> {
    let slot = match program_id {
        PUMP_FUN_PROGRAM => 3,
        PUMP_SWAP_PROGRAM => 0,
        RAYDIUM_V4_PROGRAM => 1,
        _ => return None,
    };
    ix.accounts
        .get(slot)
        .and_then(|&account_index| record.resolve_account(account_index))
        .map(ToString::to_string)
}

fn decode_curve_events(record: &TransactionRecord) -> Vec<CurveEvent> {
    let mut events = Vec::new();
    for log in &record.meta.log_messages {
        let Some(encoded) = log.strip_prefix(LOG_DATA_PREFIX) else {
            continue;
        };
        let Ok(payload) = BASE64.decode(encoded.trim()) else {
            continue;
        };
        if payload.len() < 8 || payload[..8] != CURVE_CREATE_DISCRIMINATOR {
            continue;
        }
        if let Some(event) = parse_curve_create(&payload[8..], record) {
            events.push(event);
        }
    }
    events
}

/// Create-event payload: three borsh strings (name, symbol, uri) followed by
/// the mint, bonding curve and user pubkeys.
fn parse_curve_create(payload: &[u8], record: &TransactionRecord) -> Option<CurveEvent> {
    let mut cursor = 0usize;
    for _ in 0..3 {
        let len = read_u32(payload, cursor)? as usize;
        cursor = cursor.checked_add(4)?.checked_add(len)?;
    }
    let mint = read_pubkey(payload, cursor)?;
    let bonding_curve = read_pubkey(payload, cursor + 32)?;
    let user = read_pubkey(payload, cursor + 64)?;
    Some(CurveEvent {
        signature: record.signature.clone(),
        instruction_index: None,
        user: Some(user),
        base_mint: Some(mint),
        quote_mint: Some(WSOL_MINT.to_string()),
        bonding_curve: Some(bonding_curve),
    })
}

fn read_u32(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_pubkey(payload: &[u8], offset: usize) -> Option<String> {
    let bytes = payload.get(offset..offset + 32)?;
    Some(bs58::encode(bytes).into_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexquote_core_types::{TokenBalance, TxMessage, TxMeta, TxVersion};

    const USER: &str = "UserWallet1111111111111111111111111111111111";

    fn token_balance(account_index: usize, mint: &str, owner: &str, amount_raw: u64) -> TokenBalance {
        TokenBalance {
            account_index,
            mint: mint.to_string(),
            owner: owner.to_string(),
            amount_raw,
            decimals: 6,
        }
    }

    fn base_record(program_id: &str) -> TransactionRecord {
        TransactionRecord {
            signature: "sig-1".to_string(),
            slot: 500,
            message: TxMessage {
                account_keys: vec![
                    USER.to_string(),
                    "PoolAccount11111111111111111111111111111111".to_string(),
                    "VaultA".to_string(),
                    "VaultB".to_string(),
                    program_id.to_string(),
                ],
                instructions: vec![CompiledIx {
                    program_id_index: 4,
                    // raydium pool slot is accounts[1]
                    accounts: vec![0, 1, 2, 3],
                    data: vec![9, 0, 0, 0],
                }],
                version: TxVersion::Legacy,
            },
            meta: TxMeta {
                failed: false,
                pre_balances: vec![5_000_000_000, 0, 0, 0, 0],
                post_balances: vec![5_000_000_000, 0, 0, 0, 0],
                pre_token_balances: vec![
                    token_balance(0, WSOL_MINT, USER, 1_000_000),
                    token_balance(1, "MintM", USER, 0),
                ],
                post_token_balances: vec![
                    token_balance(0, WSOL_MINT, USER, 0),
                    token_balance(1, "MintM", USER, 500),
                ],
                inner_instructions: Vec::new(),
                log_messages: Vec::new(),
            },
            block_time: None,
            connection_id: "conn".to_string(),
        }
    }

    fn extractor() -> TradeExtractor {
        TradeExtractor::new(
            [RAYDIUM_V4_PROGRAM.to_string(), PUMP_FUN_PROGRAM.to_string()]
                .into_iter()
                .collect(),
        )
    }

    #[test]
    fn whitelisted_swap_yields_buy_candidate_with_pool() {
        let outcome = extractor().extract(&base_record(RAYDIUM_V4_PROGRAM));
        assert_eq!(outcome.total_trades, 1);
        let trade = &outcome.trades[0];
        assert_eq!(trade.side, TradeSide::Buy);
        assert_eq!(trade.input_mint.as_deref(), Some(WSOL_MINT));
        assert_eq!(trade.output_mint.as_deref(), Some("MintM"));
        assert_eq!(trade.input_amount_raw, 1_000_000);
        assert_eq!(trade.output_amount_raw, 500);
        assert_eq!(trade.program_id.as_deref(), Some(RAYDIUM_V4_PROGRAM));
        assert_eq!(
            trade.pool.as_deref(),
            Some("PoolAccount11111111111111111111111111111111")
        );
        assert_eq!(trade.user.as_deref(), Some(USER));
        assert_eq!(trade.instruction_index, Some(0));
    }

    #[test]
    fn non_whitelisted_program_is_ignored() {
        let record = base_record("SomeOtherProgram1111111111111111111111111111");
        let outcome = extractor().extract(&record);
        assert!(outcome.trades.is_empty());
        assert_eq!(outcome.total_trades, 0);
    }

    #[test]
    fn sell_side_inferred_from_wsol_inflow() {
        let mut record = base_record(RAYDIUM_V4_PROGRAM);
        record.meta.pre_token_balances = vec![
            token_balance(0, WSOL_MINT, USER, 0),
            token_balance(1, "MintM", USER, 800),
        ];
        record.meta.post_token_balances = vec![
            token_balance(0, WSOL_MINT, USER, 2_000_000),
            token_balance(1, "MintM", USER, 0),
        ];
        let outcome = extractor().extract(&record);
        let trade = &outcome.trades[0];
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.input_mint.as_deref(), Some("MintM"));
        assert_eq!(trade.output_mint.as_deref(), Some(WSOL_MINT));
        assert_eq!(trade.input_amount_raw, 800);
        assert_eq!(trade.output_amount_raw, 2_000_000);
    }

    #[test]
    fn lamport_delta_stands_in_for_missing_wsol_account() {
        let mut record = base_record(RAYDIUM_V4_PROGRAM);
        record.meta.pre_token_balances = vec![token_balance(1, "MintM", USER, 0)];
        record.meta.post_token_balances = vec![token_balance(1, "MintM", USER, 750)];
        record.meta.pre_balances[0] = 5_000_000_000;
        record.meta.post_balances[0] = 3_000_000_000;
        let outcome = extractor().extract(&record);
        let trade = &outcome.trades[0];
        assert_eq!(trade.side, TradeSide::Buy);
        assert_eq!(trade.input_amount_raw, 2_000_000_000);
        assert_eq!(trade.output_mint.as_deref(), Some("MintM"));
    }

    #[test]
    fn inner_instructions_are_classified_too() {
        let mut record = base_record("SomeOuterProgram1111111111111111111111111111");
        record.meta.inner_instructions = vec![dexquote_core_types::InnerIxGroup {
            outer_index: 0,
            instructions: vec![CompiledIx {
                program_id_index: 4,
                accounts: vec![0, 1],
                data: Vec::new(),
            }],
        }];
        record.message.account_keys[4] = RAYDIUM_V4_PROGRAM.to_string();
        // outer instruction now points at a non-whitelisted index
        record.message.instructions[0].program_id_index = 2;
        let outcome = extractor().extract(&record);
        assert_eq!(outcome.total_trades, 1);
        assert_eq!(outcome.trades[0].instruction_index, Some(0));
    }

    #[test]
    fn failed_transaction_extracts_nothing() {
        let mut record = base_record(RAYDIUM_V4_PROGRAM);
        record.meta.failed = true;
        let outcome = extractor().extract(&record);
        assert!(outcome.trades.is_empty());
        assert!(outcome.curve_events.is_empty());
    }

    #[test]
    fn decoder_error_is_contained_by_fault_barrier() {
        let mut record = base_record(RAYDIUM_V4_PROGRAM);
        record.message.account_keys.clear();
        let outcome = extractor().extract(&record);
        assert_eq!(outcome.total_trades, 0);
        assert!(outcome.trades.is_empty());
    }

    fn encode_curve_create(mint: [u8; 32], curve: [u8; 32], user: [u8; 32]) -> String {
        let mut payload = Vec::new();
        payload.extend_from_slice(&CURVE_CREATE_DISCRIMINATOR);
        for text in ["token", "TKN", "https://example/meta.json"] {
            payload.extend_from_slice(&(text.len() as u32).to_le_bytes());
            payload.extend_from_slice(text.as_bytes());
        }
        payload.extend_from_slice(&mint);
        payload.extend_from_slice(&curve);
        payload.extend_from_slice(&user);
        format!("{LOG_DATA_PREFIX}{}", BASE64.encode(payload))
    }

    #[test]
    fn curve_create_event_is_decoded_from_logs() {
        let mint = [1u8; 32];
        let curve = [2u8; 32];
        let user = [3u8; 32];
        let mut record = base_record(PUMP_FUN_PROGRAM);
        record.meta.log_messages = vec![
            "Program 6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P invoke [1]".to_string(),
            encode_curve_create(mint, curve, user),
        ];
        let outcome = extractor().extract(&record);
        assert_eq!(outcome.curve_events.len(), 1);
        let event = &outcome.curve_events[0];
        assert_eq!(event.signature, "sig-1");
        assert_eq!(
            event.bonding_curve.as_deref(),
            Some(bs58::encode(curve).into_string().as_str())
        );
        assert_eq!(
            event.base_mint.as_deref(),
            Some(bs58::encode(mint).into_string().as_str())
        );
        assert_eq!(event.quote_mint.as_deref(), Some(WSOL_MINT));
    }

    #[test]
    fn malformed_program_data_logs_are_skipped() {
        let mut record = base_record(PUMP_FUN_PROGRAM);
        record.meta.log_messages = vec![
            "Program data: not-base64!!".to_string(),
            format!("{LOG_DATA_PREFIX}{}", BASE64.encode([0u8; 4])),
        ];
        let outcome = extractor().extract(&record);
        assert!(outcome.curve_events.is_empty());
    }
}
