//! Instruction model shared by programs, the compiler and clients

use crate::{address::instruction_discriminator, EscrowResult};
use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

/// An account referenced by an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountMeta {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    /// Writable account
    pub fn new(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    pub fn new_readonly(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

/// A call into one program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

impl Instruction {
    /// Build an instruction whose data is the 8-byte discriminator of `name`
    /// followed by the bincode encoding of `args`
    pub fn new_with_args<T: Serialize>(
        program_id: Pubkey,
        name: &str,
        args: &T,
        accounts: Vec<AccountMeta>,
    ) -> EscrowResult<Self> {
        let mut data = instruction_discriminator(name).to_vec();
        data.extend(bincode::serialize(args)?);
        Ok(Self {
            program_id,
            accounts,
            data,
        })
    }

    /// Instruction without arguments
    pub fn new_bare(program_id: Pubkey, name: &str, accounts: Vec<AccountMeta>) -> Self {
        Self {
            program_id,
            accounts,
            data: instruction_discriminator(name).to_vec(),
        }
    }
}

/// Split instruction data into its discriminator and argument bytes
pub fn split_discriminator(data: &[u8]) -> EscrowResult<([u8; 8], &[u8])> {
    if data.len() < 8 {
        return Err(crate::EscrowError::invalid_instruction(format!(
            "instruction data is {} bytes, expected at least 8",
            data.len()
        )));
    }
    let (head, rest) = data.split_at(8);
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(head);
    Ok((discriminator, rest))
}

/// Decode bincode-encoded instruction arguments
pub fn decode_args<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> EscrowResult<T> {
    bincode::deserialize(bytes)
        .map_err(|e| crate::EscrowError::invalid_instruction(format!("bad arguments: {}", e)))
}
