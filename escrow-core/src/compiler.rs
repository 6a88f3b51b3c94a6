//! Transaction compiler
//!
//! Serializes an instruction list into the compact form a task stores.
//! Accounts are deduplicated and addressed by a one-byte index. Accounts the
//! caller hints as only resolvable at execution time are moved out of the
//! embedded table into a remaining-accounts list indexed after it.
//!
//! Compilation never checks that referenced accounts exist; a stale payload
//! is detected when it is executed.

use crate::{
    instruction::{AccountMeta, Instruction},
    EscrowError, EscrowResult,
};
use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;
use std::collections::HashMap;

const MAX_ACCOUNTS: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    pub accounts: Vec<u8>,
    pub data: Vec<u8>,
}

/// Compiled instruction list.
///
/// The embedded `accounts` table is ordered writable signers, readonly
/// signers, writable non-signers, readonly non-signers; the header counts
/// describe those groups. Indices at or past `accounts.len()` refer to the
/// remaining accounts supplied alongside the transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledTransaction {
    pub num_rw_signers: u8,
    pub num_ro_signers: u8,
    pub num_rw: u8,
    pub accounts: Vec<Pubkey>,
    pub instructions: Vec<CompiledInstruction>,
    /// Seeds of derived signers the executing program signs for
    pub signer_seeds: Vec<Vec<Vec<u8>>>,
}

impl CompiledTransaction {
    pub fn to_bytes(&self) -> EscrowResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EscrowResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn embedded_meta(&self, index: usize) -> AccountMeta {
        let rw_signers = self.num_rw_signers as usize;
        let signers = rw_signers + self.num_ro_signers as usize;
        let writable_end = signers + self.num_rw as usize;
        AccountMeta {
            pubkey: self.accounts[index],
            is_signer: index < signers,
            is_writable: index < rw_signers || (index >= signers && index < writable_end),
        }
    }

    fn resolve(&self, index: u8, remaining: &[AccountMeta]) -> EscrowResult<AccountMeta> {
        let index = index as usize;
        if index < self.accounts.len() {
            return Ok(self.embedded_meta(index));
        }
        remaining
            .get(index - self.accounts.len())
            .copied()
            .ok_or_else(|| {
                EscrowError::invalid_instruction(format!(
                    "account index {} out of range ({} embedded, {} remaining)",
                    index,
                    self.accounts.len(),
                    remaining.len()
                ))
            })
    }

    /// Rebuild the instruction list, resolving every index against the
    /// embedded table and `remaining`
    pub fn decompile(&self, remaining: &[AccountMeta]) -> EscrowResult<Vec<Instruction>> {
        self.instructions
            .iter()
            .map(|ix| {
                let program = self.resolve(ix.program_id_index, remaining)?;
                let accounts = ix
                    .accounts
                    .iter()
                    .map(|index| self.resolve(*index, remaining))
                    .collect::<EscrowResult<Vec<_>>>()?;
                Ok(Instruction {
                    program_id: program.pubkey,
                    accounts,
                    data: ix.data.clone(),
                })
            })
            .collect()
    }
}

fn category(meta: &AccountMeta) -> u8 {
    match (meta.is_signer, meta.is_writable) {
        (true, true) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (false, false) => 3,
    }
}

/// Compile `instructions` into a [`CompiledTransaction`] plus the remaining
/// accounts named in `extra_account_hints`.
///
/// Deterministic: identical inputs produce identical output.
pub fn compile_transaction(
    instructions: &[Instruction],
    extra_account_hints: &[Pubkey],
    signer_seeds: Vec<Vec<Vec<u8>>>,
) -> EscrowResult<(CompiledTransaction, Vec<AccountMeta>)> {
    // First-appearance order with merged privileges
    let mut order: Vec<Pubkey> = Vec::new();
    let mut metas: HashMap<Pubkey, AccountMeta> = HashMap::new();
    let mut note = |meta: AccountMeta| {
        metas
            .entry(meta.pubkey)
            .and_modify(|existing| {
                existing.is_signer |= meta.is_signer;
                existing.is_writable |= meta.is_writable;
            })
            .or_insert_with(|| {
                order.push(meta.pubkey);
                meta
            });
    };
    for ix in instructions {
        note(AccountMeta::new_readonly(ix.program_id, false));
        for account in &ix.accounts {
            note(*account);
        }
    }

    if order.len() > MAX_ACCOUNTS {
        return Err(EscrowError::invalid_instruction(format!(
            "{} distinct accounts, at most {} can be indexed",
            order.len(),
            MAX_ACCOUNTS
        )));
    }

    let (mut embedded, mut remaining): (Vec<AccountMeta>, Vec<AccountMeta>) = order
        .iter()
        .map(|key| metas[key])
        .partition(|meta| !extra_account_hints.contains(&meta.pubkey));
    // sort_by_key is stable, so first-appearance order survives within a group
    embedded.sort_by_key(category);
    remaining.sort_by_key(category);

    let count = |c: u8| embedded.iter().filter(|m| category(m) == c).count() as u8;
    let (num_rw_signers, num_ro_signers, num_rw) = (count(0), count(1), count(2));

    let index_of: HashMap<Pubkey, u8> = embedded
        .iter()
        .chain(remaining.iter())
        .enumerate()
        .map(|(i, meta)| (meta.pubkey, i as u8))
        .collect();

    let compiled = instructions
        .iter()
        .map(|ix| CompiledInstruction {
            program_id_index: index_of[&ix.program_id],
            accounts: ix.accounts.iter().map(|a| index_of[&a.pubkey]).collect(),
            data: ix.data.clone(),
        })
        .collect();

    Ok((
        CompiledTransaction {
            num_rw_signers,
            num_ro_signers,
            num_rw,
            accounts: embedded.iter().map(|m| m.pubkey).collect(),
            instructions: compiled,
            signer_seeds,
        },
        remaining,
    ))
}
