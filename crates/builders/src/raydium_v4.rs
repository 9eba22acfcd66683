use anyhow::{anyhow, Context, Result};
use dexquote_core_types::{TradeSide, RAYDIUM_V4_PROGRAM, WSOL_MINT};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;
use std::str::FromStr;

use crate::{min_amount_with_slippage, BuildParams, SwapBuilder};

/// swap_base_in opcode.
const SWAP_OPCODE: u8 = 9;
const AMM_AUTHORITY_SEED: &[u8] = b"amm authority";

/// Raydium v4 AMM swaps. Data layout is the fixed 17-byte swap_base_in
/// encoding: opcode, amount_in, min_amount_out, little-endian.
pub(crate) struct RaydiumV4Builder;

impl SwapBuilder for RaydiumV4Builder {
    fn market(&self) -> &'static str {
        "raydium"
    }

    fn build(&self, params: &BuildParams<'_>) -> Result<Vec<Instruction>> {
        let program = Pubkey::from_str(RAYDIUM_V4_PROGRAM)?;
        let mint = Pubkey::from_str(params.mint).context("invalid mint address")?;
        let wsol = Pubkey::from_str(WSOL_MINT)?;
        let user = Pubkey::from_str(params.signer).context("invalid signer address")?;
        let pool = Pubkey::from_str(&params.observation.pool)
            .context("observation pool is not a valid account address")?;
        let (input_amount, output_amount) = params.resolved_amounts()?;
        if input_amount == 0 {
            return Err(anyhow!("input amount resolves to zero"));
        }

        let amm_authority = Pubkey::find_program_address(&[AMM_AUTHORITY_SEED], &program).0;
        let (source_mint, destination_mint) = match params.side {
            TradeSide::Buy => (wsol, mint),
            TradeSide::Sell => (mint, wsol),
        };
        let user_source = get_associated_token_address(&user, &source_mint);
        let user_destination = get_associated_token_address(&user, &destination_mint);

        let mut data = Vec::with_capacity(17);
        data.push(SWAP_OPCODE);
        data.extend_from_slice(&input_amount.to_le_bytes());
        data.extend_from_slice(
            &min_amount_with_slippage(output_amount, params.slippage_bps).to_le_bytes(),
        );

        let accounts = vec![
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new(pool, false),
            AccountMeta::new_readonly(amm_authority, false),
            AccountMeta::new(user_source, false),
            AccountMeta::new(user_destination, false),
            AccountMeta::new(user, true),
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

    #[test]
    fn swap_data_is_opcode_amount_min_out() {
        let (observation, mint, pool) = observation(RAYDIUM_V4_PROGRAM, 2_000.0);
        let signer = Pubkey::new_unique().to_string();
        let params = BuildParams {
            mint: &mint,
            signer: &signer,
            side: TradeSide::Buy,
            input_amount: Some(1_000_000),
            output_amount: None,
            slippage_bps: 2_000,
            observation: &observation,
        };
        let instructions = RaydiumV4Builder.build(&params).expect("buy builds");
        let swap = instructions.last().unwrap();
        assert_eq!(swap.program_id.to_string(), RAYDIUM_V4_PROGRAM);
        assert_eq!(swap.data.len(), 17);
        assert_eq!(swap.data[0], SWAP_OPCODE);
        let amount_in = u64::from_le_bytes(swap.data[1..9].try_into().unwrap());
        assert_eq!(amount_in, 1_000_000);
        let min_out = u64::from_le_bytes(swap.data[9..17].try_into().unwrap());
        assert_eq!(min_out, 400, "500 projected minus 2000 bps");
        assert_eq!(swap.accounts[1].pubkey.to_string(), pool);
        assert!(swap.accounts[5].is_signer);
    }

    #[test]
    fn sell_swaps_source_and_destination_sides() {
        let (observation, mint, _) = observation(RAYDIUM_V4_PROGRAM, 2_000.0);
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
        let instructions = RaydiumV4Builder.build(&params).expect("sell builds");
        assert_eq!(instructions.len(), 1, "no ATA create on sell");
        let swap = &instructions[0];
        let user = Pubkey::from_str(&signer).unwrap();
        let mint_key = Pubkey::from_str(&mint).unwrap();
        let wsol = Pubkey::from_str(WSOL_MINT).unwrap();
        assert_eq!(
            swap.accounts[3].pubkey,
            get_associated_token_address(&user, &mint_key)
        );
        assert_eq!(
            swap.accounts[4].pubkey,
            get_associated_token_address(&user, &wsol)
        );
    }
}
