use anyhow::{anyhow, Context, Result};
use borsh::BorshSerialize;
use dexquote_core_types::{TradeSide, PUMP_FUN_PROGRAM};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use std::str::FromStr;

use crate::{max_amount_with_slippage, min_amount_with_slippage, BuildParams, SwapBuilder};

const PUMP_GLOBAL: &str = "4wTV1YmiEkRvAtNtsSGPtUrqRYQMe5SKy2uB4Jjaxnjf";
const PUMP_FEE_RECIPIENT: &str = "CebN5WGQ4jvEPvsVU4EoHEpgzq1VV7AbicfhtW4xC9iM";
const PUMP_EVENT_AUTHORITY: &str = "Ce6TQqeHC9p8KetsN6JsjHK7UTZk7nasjjnr7XxXp9F1";
const RENT_SYSVAR: &str = "SysvarRent111111111111111111111111111111111";

const BONDING_CURVE_SEED: &[u8] = b"bonding-curve";

pub(crate) const BUY_METHOD: u64 = 16927863322537952870;
pub(crate) const SELL_METHOD: u64 = 12502976635542562355;

#[derive(BorshSerialize)]
struct SwapArgs {
    method: u64,
    /// Token amount: bought amount on buy, sold amount on sell.
    amount: u64,
    /// Lamport bound: max cost on buy, min proceeds on sell.
    limit: u64,
}

/// Launchpad bonding-curve swaps. The curve account is the pool; buys create
/// the user's token account when needed.
pub(crate) struct PumpFunBuilder;

impl SwapBuilder for PumpFunBuilder {
    fn market(&self) -> &'static str {
        "pumpfun"
    }

    fn build(&self, params: &BuildParams<'_>) -> Result<Vec<Instruction>> {
        let program = Pubkey::from_str(PUMP_FUN_PROGRAM)?;
        let mint = Pubkey::from_str(params.mint).context("invalid mint address")?;
        let user = Pubkey::from_str(params.signer).context("invalid signer address")?;
        let (input_amount, output_amount) = params.resolved_amounts()?;

        let bonding_curve = match Pubkey::from_str(&params.observation.pool) {
            Ok(pool) => pool,
            Err(_) => Pubkey::find_program_address(&[BONDING_CURVE_SEED, mint.as_ref()], &program).0,
        };
        let associated_bonding_curve = get_associated_token_address(&bonding_curve, &mint);
        let user_token_account = get_associated_token_address(&user, &mint);

        let args = match params.side {
            TradeSide::Buy => SwapArgs {
                method: BUY_METHOD,
                amount: output_amount,
                limit: max_amount_with_slippage(input_amount, params.slippage_bps),
            },
            TradeSide::Sell => SwapArgs {
                method: SELL_METHOD,
                amount: input_amount,
                limit: min_amount_with_slippage(output_amount, params.slippage_bps),
            },
        };
        if args.amount == 0 {
            return Err(anyhow!("token amount resolves to zero"));
        }

        let accounts = vec![
            AccountMeta::new_readonly(Pubkey::from_str(PUMP_GLOBAL)?, false),
            AccountMeta::new(Pubkey::from_str(PUMP_FEE_RECIPIENT)?, false),
            AccountMeta::new_readonly(mint, false),
            AccountMeta::new(bonding_curve, false),
            AccountMeta::new(associated_bonding_curve, false),
            AccountMeta::new(user_token_account, false),
            AccountMeta::new(user, true),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(Pubkey::from_str(RENT_SYSVAR)?, false),
            AccountMeta::new_readonly(Pubkey::from_str(PUMP_EVENT_AUTHORITY)?, false),
            AccountMeta::new_readonly(program, false),
        ];

        let swap = Instruction {
            program_id: program,
            accounts,
            data: borsh::to_vec(&args)?,
        };

        let mut instructions = Vec::with_capacity(2);
        if params.side == TradeSide::Buy {
            instructions.push(create_associated_token_account_idempotent(
                &user,
                &user,
                &mint,
                &spl_token::id(),
            ));
        }
        instructions.push(swap);
        Ok(instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::observation;
    use solana_sdk::pubkey::Pubkey;

    fn params<'a>(
        observation: &'a dexquote_core_types::PriceObservation,
        mint: &'a str,
        signer: &'a str,
        side: TradeSide,
    ) -> BuildParams<'a> {
        BuildParams {
            mint,
            signer,
            side,
            input_amount: Some(1_000_000),
            output_amount: None,
            slippage_bps: 5_000,
            observation,
        }
    }

    #[test]
    fn buy_creates_token_account_then_swaps() {
        let (observation, mint, pool) = observation(PUMP_FUN_PROGRAM, 2_000.0);
        let signer = Pubkey::new_unique().to_string();
        let instructions = PumpFunBuilder
            .build(&params(&observation, &mint, &signer, TradeSide::Buy))
            .expect("buy builds");
        assert_eq!(instructions.len(), 2, "ATA create + swap");

        let swap = &instructions[1];
        assert_eq!(swap.program_id.to_string(), PUMP_FUN_PROGRAM);
        assert_eq!(swap.accounts.len(), 12);
        // bonding curve comes from the observation pool
        assert_eq!(swap.accounts[3].pubkey.to_string(), pool);
        // the user signs
        let user_meta = &swap.accounts[6];
        assert_eq!(user_meta.pubkey.to_string(), signer);
        assert!(user_meta.is_signer);

        let method = u64::from_le_bytes(swap.data[0..8].try_into().unwrap());
        assert_eq!(method, BUY_METHOD);
        let amount = u64::from_le_bytes(swap.data[8..16].try_into().unwrap());
        assert_eq!(amount, 500, "1_000_000 / 2_000");
        let limit = u64::from_le_bytes(swap.data[16..24].try_into().unwrap());
        assert_eq!(limit, 1_500_000, "input padded by 5000 bps");
    }

    #[test]
    fn sell_is_single_instruction_with_min_proceeds() {
        let (observation, mint, _) = observation(PUMP_FUN_PROGRAM, 2_000.0);
        let signer = Pubkey::new_unique().to_string();
        let mut build_params = params(&observation, &mint, &signer, TradeSide::Sell);
        build_params.input_amount = Some(500);
        let instructions = PumpFunBuilder.build(&build_params).expect("sell builds");
        assert_eq!(instructions.len(), 1);

        let swap = &instructions[0];
        let method = u64::from_le_bytes(swap.data[0..8].try_into().unwrap());
        assert_eq!(method, SELL_METHOD);
        let amount = u64::from_le_bytes(swap.data[8..16].try_into().unwrap());
        assert_eq!(amount, 500);
        let limit = u64::from_le_bytes(swap.data[16..24].try_into().unwrap());
        assert_eq!(limit, 500_000, "1_000_000 proceeds cut by 5000 bps");
    }

    #[test]
    fn unparseable_pool_falls_back_to_derived_curve() {
        let (mut observation, mint, _) = observation(PUMP_FUN_PROGRAM, 2_000.0);
        observation.pool = "not-a-pubkey".to_string();
        let signer = Pubkey::new_unique().to_string();
        let instructions = PumpFunBuilder
            .build(&params(&observation, &mint, &signer, TradeSide::Buy))
            .expect("derived curve builds");
        let expected = Pubkey::find_program_address(
            &[
                BONDING_CURVE_SEED,
                Pubkey::from_str(&mint).unwrap().as_ref(),
            ],
            &Pubkey::from_str(PUMP_FUN_PROGRAM).unwrap(),
        )
        .0;
        assert_eq!(instructions[1].accounts[3].pubkey, expected);
    }
}
