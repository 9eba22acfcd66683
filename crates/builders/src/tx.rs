use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::str::FromStr;

/// Text encoding applied to the serialized transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxEncoding {
    #[default]
    Base64,
    Base58,
}

impl TxEncoding {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "base64" => Ok(Self::Base64),
            "base58" => Ok(Self::Base58),
            other => Err(anyhow!("unsupported transaction encoding: {other}")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base64 => "base64",
            Self::Base58 => "base58",
        }
    }
}

/// Compiles a v0 message with the signer as fee payer and wraps it in an
/// unsigned transaction: signature slots are zero-filled placeholders for
/// the caller's wallet to fill.
pub fn assemble_unsigned_v0(
    payer: &str,
    instructions: &[Instruction],
    recent_blockhash: Hash,
) -> Result<VersionedTransaction> {
    let payer = Pubkey::from_str(payer).context("invalid payer address")?;
    let message = v0::Message::try_compile(&payer, instructions, &[], recent_blockhash)
        .context("failed compiling v0 message")?;
    let signature_slots = message.header.num_required_signatures as usize;
    Ok(VersionedTransaction {
        signatures: vec![Signature::default(); signature_slots],
        message: VersionedMessage::V0(message),
    })
}

pub fn serialize_and_encode(
    transaction: &VersionedTransaction,
    encoding: TxEncoding,
) -> Result<String> {
    let bytes = bincode::serialize(transaction).context("failed serializing transaction")?;
    Ok(match encoding {
        TxEncoding::Base64 => BASE64.encode(bytes),
        TxEncoding::Base58 => bs58::encode(bytes).into_string(),
    })
}

pub fn decode_transaction(encoded: &str, encoding: TxEncoding) -> Result<VersionedTransaction> {
    let bytes = match encoding {
        TxEncoding::Base64 => BASE64
            .decode(encoded)
            .context("invalid base64 transaction")?,
        TxEncoding::Base58 => bs58::decode(encoded)
            .into_vec()
            .context("invalid base58 transaction")?,
    };
    bincode::deserialize(&bytes).context("failed deserializing transaction")
}
