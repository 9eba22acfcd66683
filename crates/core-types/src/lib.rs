use serde::{Deserialize, Serialize};

/// Wrapped SOL, the universal quote token. Every price in the index is
/// expressed as WSOL-per-base in raw units.
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Launchpad bonding-curve program.
pub const PUMP_FUN_PROGRAM: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";
/// Post-graduation AMM for launchpad tokens.
pub const PUMP_SWAP_PROGRAM: &str = "pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA";
/// Raydium liquidity pool v4.
pub const RAYDIUM_V4_PROGRAM: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";

/// Transaction wire format generation. Downstream code branches on the tag
/// instead of probing for optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxVersion {
    Legacy,
    V0,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledIx {
    pub program_id_index: usize,
    pub accounts: Vec<usize>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerIxGroup {
    /// Index of the outer instruction this group nests under.
    pub outer_index: usize,
    pub instructions: Vec<CompiledIx>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    pub owner: String,
    pub amount_raw: u64,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxMeta {
    pub failed: bool,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
    pub pre_token_balances: Vec<TokenBalance>,
    pub post_token_balances: Vec<TokenBalance>,
    pub inner_instructions: Vec<InnerIxGroup>,
    pub log_messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxMessage {
    /// Static keys followed by loaded lookup-table addresses (writable then
    /// readonly), so instruction account indices resolve uniformly for both
    /// message versions.
    pub account_keys: Vec<String>,
    pub instructions: Vec<CompiledIx>,
    pub version: TxVersion,
}

/// The unit handed from the transaction source to the extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: String,
    pub slot: u64,
    pub message: TxMessage,
    pub meta: TxMeta,
    pub block_time: Option<i64>,
    /// Identifier of the producing subscription. Records from a replaced
    /// subscription are discarded during reconnect races.
    pub connection_id: String,
}

impl TransactionRecord {
    /// First account key is the fee payer and, for every swap this service
    /// watches, the acting user.
    pub fn signer(&self) -> Option<&str> {
        self.message.account_keys.first().map(String::as_str)
    }

    pub fn resolve_account(&self, index: usize) -> Option<&str> {
        self.message.account_keys.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    /// Quote (WSOL) in, base out.
    Buy,
    /// Base in, quote (WSOL) out.
    Sell,
}

impl TradeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// One recognized swap inside a transaction, before validation. Amounts are
/// native integer units with decimals ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCandidate {
    pub side: TradeSide,
    pub input_mint: Option<String>,
    pub output_mint: Option<String>,
    pub input_amount_raw: u64,
    pub output_amount_raw: u64,
    pub program_id: Option<String>,
    pub pool: Option<String>,
    pub signature: String,
    pub slot: u64,
    pub instruction_index: Option<usize>,
    pub user: Option<String>,
}

/// Auxiliary bonding-curve record decoded from launchpad program logs.
/// Supplies the pool when the trade instruction itself does not carry one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveEvent {
    pub signature: String,
    pub instruction_index: Option<usize>,
    pub user: Option<String>,
    pub base_mint: Option<String>,
    pub quote_mint: Option<String>,
    pub bonding_curve: Option<String>,
}

/// The latest validated price for one mint; the value type of the price index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceObservation {
    pub mint: String,
    pub pool: String,
    /// Quote-per-base in raw units; always finite and positive once admitted.
    pub avg_price: f64,
    pub program_id: String,
    /// Decimal string form of the source slot.
    pub slot: String,
    pub stored_at_ms: i64,
    pub last_access_ms: i64,
}

impl PriceObservation {
    pub fn new(
        mint: impl Into<String>,
        pool: impl Into<String>,
        avg_price: f64,
        program_id: impl Into<String>,
        slot: u64,
        now_ms: i64,
    ) -> Self {
        Self {
            mint: mint.into(),
            pool: pool.into(),
            avg_price,
            program_id: program_id.into(),
            slot: slot.to_string(),
            stored_at_ms: now_ms,
            last_access_ms: now_ms,
        }
    }
}
