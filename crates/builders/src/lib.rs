mod pump_fun;
mod pump_swap;
mod raydium_v4;
mod tx;

pub use tx::{assemble_unsigned_v0, decode_transaction, serialize_and_encode, TxEncoding};

use anyhow::{anyhow, Result};
use dexquote_core_types::{PriceObservation, TradeSide};
use solana_sdk::instruction::Instruction;
use std::collections::{HashMap, HashSet};

pub const BPS_DENOMINATOR: u64 = 10_000;

/// Uniform parameters handed to every protocol builder. Exactly one of the
/// amounts is caller-provided; the other side is projected from the
/// observation's average price.
pub struct BuildParams<'a> {
    pub mint: &'a str,
    pub signer: &'a str,
    pub side: TradeSide,
    pub input_amount: Option<u64>,
    pub output_amount: Option<u64>,
    pub slippage_bps: u64,
    pub observation: &'a PriceObservation,
}

impl BuildParams<'_> {
    /// Resolved (input, output) raw amounts, projecting the missing side.
    pub fn resolved_amounts(&self) -> Result<(u64, u64)> {
        project_amounts(
            self.side,
            self.observation.avg_price,
            self.input_amount,
            self.output_amount,
        )
    }
}

/// Projects the missing amount side from the average price (quote-per-base).
/// SELL projections floor to whole raw units.
pub fn project_amounts(
    side: TradeSide,
    avg_price: f64,
    input_amount: Option<u64>,
    output_amount: Option<u64>,
) -> Result<(u64, u64)> {
    if !(avg_price.is_finite() && avg_price > 0.0) {
        return Err(anyhow!("average price must be positive and finite"));
    }
    match (side, input_amount, output_amount) {
        (TradeSide::Buy, Some(input), None) => Ok((input, (input as f64 / avg_price) as u64)),
        (TradeSide::Buy, None, Some(output)) => Ok(((output as f64 * avg_price) as u64, output)),
        (TradeSide::Sell, Some(input), None) => {
            Ok((input, (input as f64 * avg_price).floor() as u64))
        }
        (TradeSide::Sell, None, Some(output)) => {
            Ok(((output as f64 / avg_price).floor() as u64, output))
        }
        _ => Err(anyhow!("exactly one of input/output amount is required")),
    }
}

/// Worst-acceptable floor on the amount received, at `slippage_bps` below
/// the projected amount.
pub fn min_amount_with_slippage(expected: u64, slippage_bps: u64) -> u64 {
    let kept = BPS_DENOMINATOR.saturating_sub(slippage_bps) as u128;
    ((expected as u128 * kept) / BPS_DENOMINATOR as u128) as u64
}

/// Worst-acceptable ceiling on the amount paid, at `slippage_bps` above the
/// projected amount.
pub fn max_amount_with_slippage(expected: u64, slippage_bps: u64) -> u64 {
    let padded = (BPS_DENOMINATOR + slippage_bps) as u128;
    ((expected as u128 * padded) / BPS_DENOMINATOR as u128).min(u64::MAX as u128) as u64
}

/// One protocol's swap-instruction encoder.
pub trait SwapBuilder: Send + Sync {
    /// Market tag shown in quote responses, e.g. "raydium".
    fn market(&self) -> &'static str;
    fn build(&self, params: &BuildParams<'_>) -> Result<Vec<Instruction>>;
}

/// Maps a DEX program id to its swap builder. The key set doubles as the
/// trade-admission whitelist upstream: registering or removing a builder
/// changes which trades are admitted.
pub struct BuilderRegistry {
    builders: HashMap<String, Box<dyn SwapBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        let mut builders: HashMap<String, Box<dyn SwapBuilder>> = HashMap::new();
        builders.insert(
            dexquote_core_types::PUMP_FUN_PROGRAM.to_string(),
            Box::new(pump_fun::PumpFunBuilder),
        );
        builders.insert(
            dexquote_core_types::PUMP_SWAP_PROGRAM.to_string(),
            Box::new(pump_swap::PumpSwapBuilder),
        );
        builders.insert(
            dexquote_core_types::RAYDIUM_V4_PROGRAM.to_string(),
            Box::new(raydium_v4::RaydiumV4Builder),
        );
        Self { builders }
    }

    pub fn has_builder(&self, program_id: &str) -> bool {
        self.builders.contains_key(program_id)
    }

    pub fn market_for_program_id(&self, program_id: &str) -> Option<&'static str> {
        self.builders.get(program_id).map(|builder| builder.market())
    }

    pub fn supported_program_ids(&self) -> HashSet<String> {
        self.builders.keys().cloned().collect()
    }

    pub fn supported_markets(&self) -> Vec<&'static str> {
        let mut markets: Vec<&'static str> =
            self.builders.values().map(|builder| builder.market()).collect();
        markets.sort_unstable();
        markets
    }

    pub fn build(&self, program_id: &str, params: &BuildParams<'_>) -> Result<Vec<Instruction>> {
        let builder = self
            .builders
            .get(program_id)
            .ok_or_else(|| anyhow!("no builder registered for program {program_id}"))?;
        builder.build(params)
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use dexquote_core_types::PriceObservation;
    use solana_sdk::pubkey::Pubkey;

    pub(crate) fn observation(program_id: &str, avg_price: f64) -> (PriceObservation, String, String) {
        let mint = Pubkey::new_unique().to_string();
        let pool = Pubkey::new_unique().to_string();
        let observation = PriceObservation::new(
            mint.clone(),
            pool.clone(),
            avg_price,
            program_id,
            312_000_000,
            0,
        );
        (observation, mint, pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dexquote_core_types::{PUMP_FUN_PROGRAM, PUMP_SWAP_PROGRAM, RAYDIUM_V4_PROGRAM};
    use solana_sdk::pubkey::Pubkey;

    #[test]
    fn registry_enumerates_compiled_in_protocols() {
        let registry = BuilderRegistry::new();
        let supported = registry.supported_program_ids();
        assert_eq!(supported.len(), 3);
        for program in [PUMP_FUN_PROGRAM, PUMP_SWAP_PROGRAM, RAYDIUM_V4_PROGRAM] {
            assert!(registry.has_builder(program), "missing builder: {program}");
            assert!(supported.contains(program));
        }
        assert!(!registry.has_builder("NotAProgram"));
    }

    #[test]
    fn market_tags_match_protocols() {
        let registry = BuilderRegistry::new();
        assert_eq!(
            registry.market_for_program_id(PUMP_FUN_PROGRAM),
            Some("pumpfun")
        );
        assert_eq!(
            registry.market_for_program_id(PUMP_SWAP_PROGRAM),
            Some("pumpswap")
        );
        assert_eq!(
            registry.market_for_program_id(RAYDIUM_V4_PROGRAM),
            Some("raydium")
        );
        assert_eq!(registry.market_for_program_id("NotAProgram"), None);
    }

    #[test]
    fn unknown_program_build_is_an_error() {
        let registry = BuilderRegistry::new();
        let (observation, mint, _) = test_support::observation("NotAProgram", 2_000.0);
        let signer = Pubkey::new_unique().to_string();
        let params = BuildParams {
            mint: &mint,
            signer: &signer,
            side: dexquote_core_types::TradeSide::Buy,
            input_amount: Some(1_000_000),
            output_amount: None,
            slippage_bps: 5_000,
            observation: &observation,
        };
        let err = registry
            .build("NotAProgram", &params)
            .expect_err("unknown program must fail");
        assert!(err.to_string().contains("NotAProgram"));
    }

    #[test]
    fn buy_projection_divides_by_price() {
        let (input, output) =
            project_amounts(dexquote_core_types::TradeSide::Buy, 2_000.0, Some(1_000_000), None)
                .unwrap();
        assert_eq!(input, 1_000_000);
        assert_eq!(output, 500);
    }

    #[test]
    fn buy_projection_is_inverse_consistent() {
        let price = 2_000.0;
        let amount_in = 1_000_000u64;
        let (_, projected_out) =
            project_amounts(dexquote_core_types::TradeSide::Buy, price, Some(amount_in), None)
                .unwrap();
        let (recovered_in, _) =
            project_amounts(dexquote_core_types::TradeSide::Buy, price, None, Some(projected_out))
                .unwrap();
        assert_eq!(recovered_in, amount_in);
    }

    #[test]
    fn sell_projections_floor() {
        let (input, output) =
            project_amounts(dexquote_core_types::TradeSide::Sell, 0.3, Some(1_001), None).unwrap();
        assert_eq!(input, 1_001);
        assert_eq!(output, 300, "1001 * 0.3 floors to 300");
        let (input, output) =
            project_amounts(dexquote_core_types::TradeSide::Sell, 0.3, None, Some(100)).unwrap();
        assert_eq!(output, 100);
        assert_eq!(input, 333, "100 / 0.3 floors to 333");
    }

    #[test]
    fn projection_requires_exactly_one_amount() {
        assert!(project_amounts(
            dexquote_core_types::TradeSide::Buy,
            2_000.0,
            Some(1),
            Some(1)
        )
        .is_err());
        assert!(
            project_amounts(dexquote_core_types::TradeSide::Buy, 2_000.0, None, None).is_err()
        );
        assert!(project_amounts(dexquote_core_types::TradeSide::Buy, 0.0, Some(1), None).is_err());
    }

    #[test]
    fn slippage_bounds() {
        assert_eq!(min_amount_with_slippage(10_000, 1_000), 9_000);
        assert_eq!(max_amount_with_slippage(10_000, 1_000), 11_000);
        assert_eq!(min_amount_with_slippage(10_000, 10_000), 0);
        assert_eq!(min_amount_with_slippage(0, 5_000), 0);
    }
}
