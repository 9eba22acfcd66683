use anyhow::{anyhow, Context, Result};
use borsh::BorshSerialize;
use dexquote_core_types::{TradeSide, PUMP_SWAP_PROGRAM, WSOL_MINT};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use std::str::FromStr;

use crate::{max_amount_with_slippage, min_amount_with_slippage, BuildParams, SwapBuilder};

const GLOBAL_CONFIG: &str = "ADyA8hdefvWN2dbGGWFotbzWxrAvLW83WG6QCVXvJKqw";
const PROTOCOL_FEE_RECIPIENT: &str = "62qc2CNXwrYqQScmEdiZFFAnJR262PxWEuNQtxfafNgV";
const EVENT_AUTHORITY: &str = "GS4CU59F31iL7aR2Q8zVS8DRrcRnXX1yjQ66TqNVQnaR";

const BUY_DISCRIMINATOR: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];
const SELL_DISCRIMINATOR: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 173];

#[derive(BorshSerialize)]
struct SwapArgs {
    /// Base token amount: bought on buy, sold on sell.
    base_amount: u64,
    /// Quote bound: max spent on buy, min received on sell.
    quote_limit: u64,
}

/// Post-graduation AMM swaps. The pool account comes from the observation;
/// base is the traded token, quote is WSOL.
pub(crate) struct PumpSwapBuilder;

impl SwapBuilder for PumpSwapBuilder {
    fn market(&self) -> &'static str {
        "pumpswap"
    }

    fn build(&self, params: &BuildParams<'_>) -> Result<Vec<Instruction>> {
        let program = Pubkey::from_str(PUMP_SWAP_PROGRAM)?;
        let base_mint = Pubkey::from_str(params.mint).context("invalid mint address")?;
        let quote_mint = Pubkey::from_str(WSOL_MINT)?;
        let user = Pubkey::from_str(params.signer).context("invalid signer address")?;
        let pool = Pubkey::from_str(&params.observation.pool)
            .context("observation pool is not a valid account address")?;
        let (input_amount, output_amount) = params.resolved_amounts()?;

        let (base_amount, quote_limit) = match params.side {
            TradeSide::Buy => (
                output_amount,
                max_amount_with_slippage(input_amount, params.slippage_bps),
            ),
            TradeSide::Sell => (
                input_amount,
                min_amount_with_slippage(output_amount, params.slippage_bps),
            ),
        };
        if base_amount == 0 {
            return Err(anyhow!("base amount resolves to zero"));
        }

        let user_base_ata = get_associated_token_address(&user, &base_mint);
        let user_quote_ata = get_associated_token_address(&user, &quote_mint);
        let pool_base_ata = get_associated_token_address(&pool, &base_mint);
        let pool_quote_ata = get_associated_token_address(&pool, &quote_mint);

        let mut data = Vec::with_capacity(24);
        match params.side {
            TradeSide::Buy => data.extend_from_slice(&BUY_DISCRIMINATOR),
            TradeSide::Sell => data.extend_from_slice(&SELL_DISCRIMINATOR),
        }
        let args = SwapArgs {
            base_amount,
            quote_limit,
        };
        args.serialize(&mut data)?;

        let accounts = vec![
            AccountMeta::new(pool, false),
            AccountMeta::new(user, true),
            AccountMeta::new_readonly(Pubkey::from_str(GLOBAL_CONFIG)?, false),
            AccountMeta::new_readonly(base_mint, false),
            AccountMeta::new_readonly(quote_mint, false),
            AccountMeta::new(user_base_ata, false),
            AccountMeta::new(user_quote_ata, false),
            AccountMeta::new(pool_base_ata, false),
            AccountMeta::new(pool_quote_ata, false),
            AccountMeta::new(Pubkey::from_str(PROTOCOL_FEE_RECIPIENT)?, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new_readonly(Pubkey::from_str(EVENT_AUTHORITY)?, false),
            AccountMeta::new_readonly(program, false),
        ];

        let swap = Instruction {
            program_id: program,
            accounts,
            data,
        };

        let mut instructions = Vec::with_capacity(2);
        if params.side == TradeSide::Buy {
            instructions.push(create_associated_token_account_idempotent(
                &user,
                &user,
                &base_mint,
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

    #[test]
    fn buy_encodes_discriminator_and_bounds() {
        let (observation, mint, pool) = observation(PUMP_SWAP_PROGRAM, 2_000.0);
        let signer = Pubkey::new_unique().to_string();
        let params = BuildParams {
            mint: &mint,
            signer: &signer,
            side: TradeSide::Buy,
            input_amount: Some(1_000_000),
            output_amount: None,
            slippage_bps: 1_000,
            observation: &observation,
        };
        let instructions = PumpSwapBuilder.build(&params).expect("buy builds");
        assert_eq!(instructions.len(), 2);

        let swap = &instructions[1];
        assert_eq!(swap.program_id.to_string(), PUMP_SWAP_PROGRAM);
        assert_eq!(swap.accounts.len(), 14);
        assert_eq!(swap.accounts[0].pubkey.to_string(), pool);
        assert!(swap.accounts[1].is_signer);

        assert_eq!(&swap.data[0..8], &BUY_DISCRIMINATOR);
        let base_amount = u64::from_le_bytes(swap.data[8..16].try_into().unwrap());
        assert_eq!(base_amount, 500);
        let quote_limit = u64::from_le_bytes(swap.data[16..24].try_into().unwrap());
        assert_eq!(quote_limit, 1_100_000);
    }

    #[test]
    fn sell_uses_min_quote_floor() {
        let (observation, mint, _) = observation(PUMP_SWAP_PROGRAM, 2_000.0);
        let signer = Pubkey::new_unique().to_string();
        let params = BuildParams {
            mint: &mint,
            signer: &signer,
            side: TradeSide::Sell,
            input_amount: Some(500),
            output_amount: None,
            slippage_bps: 1_000,
            observation: &observation,
        };
        let instructions = PumpSwapBuilder.build(&params).expect("sell builds");
        assert_eq!(instructions.len(), 1);
        let swap = &instructions[0];
        assert_eq!(&swap.data[0..8], &SELL_DISCRIMINATOR);
        let base_amount = u64::from_le_bytes(swap.data[8..16].try_into().unwrap());
        assert_eq!(base_amount, 500);
        let quote_limit = u64::from_le_bytes(swap.data[16..24].try_into().unwrap());
        assert_eq!(quote_limit, 900_000);
    }

    #[test]
    fn invalid_pool_is_rejected() {
        let (mut observation, mint, _) = observation(PUMP_SWAP_PROGRAM, 2_000.0);
        observation.pool = "not-a-pubkey".to_string();
        let signer = Pubkey::new_unique().to_string();
        let params = BuildParams {
            mint: &mint,
            signer: &signer,
            side: TradeSide::Buy,
            input_amount: Some(1_000_000),
            output_amount: None,
            slippage_bps: 1_000,
            observation: &observation,
        };
        assert!(PumpSwapBuilder.build(&params).is_err());
    }
}
