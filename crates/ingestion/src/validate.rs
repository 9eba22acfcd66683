use chrono::Utc;
use dexquote_core_types::{
    CurveEvent, PriceObservation, TradeCandidate, TradeSide, TransactionRecord, WSOL_MINT,
};
use std::collections::HashSet;
use std::fmt;

/// System program id doubles as the "no account" sentinel in upstream data.
const SENTINEL_PUBKEY: &str = "11111111111111111111111111111111";

/// Minimum lamport move considered a real SOL leg in the balance-delta
/// fallback; smaller deltas are fees.
const LAMPORT_DELTA_FLOOR: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    SolToSol,
    MissingMint,
    MissingPool,
    InvalidPrice,
    MissingProgram,
    UnsupportedProgram(String),
    MissingSlot,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SolToSol => write!(f, "both legs are wrapped SOL"),
            Self::MissingMint => write!(f, "no resolvable non-SOL mint"),
            Self::MissingPool => write!(f, "no pool account resolved"),
            Self::InvalidPrice => write!(f, "average price is zero or not finite"),
            Self::MissingProgram => write!(f, "no program id on candidate"),
            Self::UnsupportedProgram(program) => {
                write!(f, "program {program} has no registered builder")
            }
            Self::MissingSlot => write!(f, "candidate carries no slot"),
        }
    }
}

/// Filters and repairs trade candidates into price observations. Rejections
/// carry a human-readable reason; they are counted by the caller, never
/// propagated.
pub struct TradeValidator {
    whitelist: HashSet<String>,
}

impl TradeValidator {
    pub fn new(whitelist: HashSet<String>) -> Self {
        Self { whitelist }
    }

    pub fn validate_all(
        &self,
        trades: &[TradeCandidate],
        curve_events: &[CurveEvent],
        record: &TransactionRecord,
    ) -> (Vec<PriceObservation>, Vec<RejectReason>) {
        let mut observations = Vec::new();
        let mut rejections = Vec::new();
        for index in 0..trades.len() {
            match self.validate_one(index, trades, curve_events, record) {
                Ok(observation) => observations.push(observation),
                Err(reason) => rejections.push(reason),
            }
        }
        (observations, rejections)
    }

    fn validate_one(
        &self,
        index: usize,
        trades: &[TradeCandidate],
        curve_events: &[CurveEvent],
        record: &TransactionRecord,
    ) -> Result<PriceObservation, RejectReason> {
        let candidate = &trades[index];

        if candidate.input_mint.as_deref() == Some(WSOL_MINT)
            && candidate.output_mint.as_deref() == Some(WSOL_MINT)
        {
            return Err(RejectReason::SolToSol);
        }

        let (input_amount, output_amount) = repair_amounts(index, trades);

        let mut avg_price = match candidate.side {
            TradeSide::Buy => ratio(input_amount, output_amount),
            TradeSide::Sell => ratio(output_amount, input_amount),
        };

        let mint = resolve_mint(index, trades).ok_or(RejectReason::MissingMint)?;

        if avg_price <= 0.0 || !avg_price.is_finite() {
            if let Some(fallback) = balance_delta_price(record, &mint) {
                avg_price = fallback;
            }
        }

        let pool = candidate
            .pool
            .clone()
            .or_else(|| join_curve_events(candidate, curve_events))
            .ok_or(RejectReason::MissingPool)?;

        if is_sentinel(&mint) {
            return Err(RejectReason::MissingMint);
        }
        if is_sentinel(&pool) {
            return Err(RejectReason::MissingPool);
        }
        if avg_price <= 0.0 || !avg_price.is_finite() {
            return Err(RejectReason::InvalidPrice);
        }
        let program_id = candidate
            .program_id
            .as_deref()
            .filter(|program| !is_sentinel(program))
            .ok_or(RejectReason::MissingProgram)?;
        if !self.whitelist.contains(program_id) {
            return Err(RejectReason::UnsupportedProgram(program_id.to_string()));
        }
        if candidate.slot == 0 {
            return Err(RejectReason::MissingSlot);
        }

        Ok(PriceObservation::new(
            mint,
            pool,
            avg_price,
            program_id,
            candidate.slot,
            Utc::now().timestamp_millis(),
        ))
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn is_sentinel(value: &str) -> bool {
    value.is_empty() || value == "unknown" || value == SENTINEL_PUBKEY
}

/// Zero-amount sides are borrowed from a sibling candidate in the same
/// transaction: first one sharing a mint with non-zero amounts, else the
/// first sibling with non-zero amounts at all.
fn repair_amounts(index: usize, trades: &[TradeCandidate]) -> (u64, u64) {
    let candidate = &trades[index];
    let mut input_amount = candidate.input_amount_raw;
    let mut output_amount = candidate.output_amount_raw;
    if input_amount != 0 && output_amount != 0 {
        return (input_amount, output_amount);
    }

    let donor = find_donor(index, trades, true).or_else(|| find_donor(index, trades, false));
    if let Some(donor) = donor {
        if input_amount == 0 {
            input_amount = donor.input_amount_raw;
        }
        if output_amount == 0 {
            output_amount = donor.output_amount_raw;
        }
    }
    (input_amount, output_amount)
}

fn find_donor<'a>(
    index: usize,
    trades: &'a [TradeCandidate],
    require_shared_mint: bool,
) -> Option<&'a TradeCandidate> {
    let candidate = &trades[index];
    trades.iter().enumerate().find_map(|(other_index, other)| {
        if other_index == index
            || other.input_amount_raw == 0
            || other.output_amount_raw == 0
        {
            return None;
        }
        if require_shared_mint && !shares_mint(candidate, other) {
            return None;
        }
        Some(other)
    })
}

fn shares_mint(a: &TradeCandidate, b: &TradeCandidate) -> bool {
    let a_mints = [a.input_mint.as_deref(), a.output_mint.as_deref()];
    let b_mints = [b.input_mint.as_deref(), b.output_mint.as_deref()];
    a_mints
        .iter()
        .flatten()
        .any(|mint| b_mints.iter().flatten().any(|other| other == mint))
}

/// The observation key: the non-WSOL side, preferring output. When the
/// candidate has neither, borrow from a sibling in the same transaction.
fn resolve_mint(index: usize, trades: &[TradeCandidate]) -> Option<String> {
    fn own_mint(candidate: &TradeCandidate) -> Option<String> {
        if let Some(output) = candidate.output_mint.as_deref() {
            if output != WSOL_MINT {
                return Some(output.to_string());
            }
        }
        if let Some(input) = candidate.input_mint.as_deref() {
            if input != WSOL_MINT {
                return Some(input.to_string());
            }
        }
        None
    }

    own_mint(&trades[index]).or_else(|| {
        trades
            .iter()
            .enumerate()
            .filter(|(other_index, _)| *other_index != index)
            .find_map(|(_, other)| own_mint(other))
    })
}

/// Fallback price from the transaction's balance deltas: the largest lamport
/// move above the fee floor against the target mint's net token move.
fn balance_delta_price(record: &TransactionRecord, mint: &str) -> Option<f64> {
    let sol_magnitude = record
        .meta
        .pre_balances
        .iter()
        .zip(record.meta.post_balances.iter())
        .map(|(&pre, &post)| pre.abs_diff(post))
        .filter(|&delta| delta > LAMPORT_DELTA_FLOOR)
        .max()?;

    let pre_total: u64 = record
        .meta
        .pre_token_balances
        .iter()
        .filter(|balance| balance.mint == mint)
        .map(|balance| balance.amount_raw)
        .sum();
    let post_total: u64 = record
        .meta
        .post_token_balances
        .iter()
        .filter(|balance| balance.mint == mint)
        .map(|balance| balance.amount_raw)
        .sum();
    let token_magnitude = pre_total.abs_diff(post_total);
    if token_magnitude == 0 {
        return None;
    }
    Some(sol_magnitude as f64 / token_magnitude as f64)
}

/// Three progressively looser joins against the transaction's curve events.
/// The last stage ("any event by the same user") can over-attribute when a
/// user lands several trades in one block; accepted trade-off for coverage.
fn join_curve_events(candidate: &TradeCandidate, curve_events: &[CurveEvent]) -> Option<String> {
    let by_signature = curve_events.iter().find(|event| {
        event.signature == candidate.signature
            && event.instruction_index == candidate.instruction_index
    });
    if let Some(pool) = by_signature.and_then(|event| event.bonding_curve.clone()) {
        return Some(pool);
    }

    let by_user_and_pair = curve_events.iter().find(|event| {
        event.user.is_some()
            && event.user == candidate.user
            && pair_matches(candidate, event)
    });
    if let Some(pool) = by_user_and_pair.and_then(|event| event.bonding_curve.clone()) {
        return Some(pool);
    }

    curve_events
        .iter()
        .find(|event| event.user.is_some() && event.user == candidate.user)
        .and_then(|event| event.bonding_curve.clone())
}

fn pair_matches(candidate: &TradeCandidate, event: &CurveEvent) -> bool {
    let event_mints = [event.base_mint.as_deref(), event.quote_mint.as_deref()];
    let candidate_mints: Vec<&str> = [
        candidate.input_mint.as_deref(),
        candidate.output_mint.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    !candidate_mints.is_empty()
        && candidate_mints
            .iter()
            .all(|mint| event_mints.iter().flatten().any(|other| other == mint))
}
