//! Escrow program instructions
//!
//! Builders take the high-level parties and derive every other account, so
//! clients and the program agree on addresses by construction.

use crate::ESCROW_PROGRAM_ID;
use escrow_core::{
    address::{
        associated_token_address, escrow_address, queue_authority_address, task_address,
        task_queue_authority_address, ASSOCIATED_TOKEN_PROGRAM_ID, SYSTEM_PROGRAM_ID,
        TOKEN_PROGRAM_ID,
    },
    AccountMeta, EscrowResult, Instruction, Pubkey,
};
use escrow_queue::TASK_QUEUE_PROGRAM_ID;
use serde::{Deserialize, Serialize};

pub const MAKE: &str = "make";
pub const TAKE: &str = "take";
pub const REFUND: &str = "refund";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeArgs {
    pub seed: u64,
    pub deposit: u64,
    pub receive: u64,
    pub task_id: u16,
    pub expiry: i64,
}

/// Accounts shared by every escrow instruction
#[derive(Debug, Clone, Copy)]
pub struct EscrowAccounts {
    pub maker: Pubkey,
    pub mint_a: Pubkey,
    pub mint_b: Pubkey,
    pub escrow: Pubkey,
    pub vault: Pubkey,
}

impl EscrowAccounts {
    pub fn derive(maker: Pubkey, mint_a: Pubkey, mint_b: Pubkey, seed: u64) -> Self {
        let (escrow, _) = escrow_address(&ESCROW_PROGRAM_ID, &maker, seed);
        Self {
            maker,
            mint_a,
            mint_b,
            escrow,
            vault: associated_token_address(&escrow, &mint_a),
        }
    }
}

pub fn make(
    accounts: &EscrowAccounts,
    task_queue: Pubkey,
    args: &MakeArgs,
) -> EscrowResult<Instruction> {
    let (queue_authority, _) = queue_authority_address(&ESCROW_PROGRAM_ID);
    let (registration, _) =
        task_queue_authority_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, &queue_authority);
    let (task, _) = task_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, args.task_id);
    Instruction::new_with_args(
        ESCROW_PROGRAM_ID,
        MAKE,
        args,
        vec![
            AccountMeta::new(accounts.maker, true),
            AccountMeta::new_readonly(accounts.mint_a, false),
            AccountMeta::new_readonly(accounts.mint_b, false),
            AccountMeta::new(associated_token_address(&accounts.maker, &accounts.mint_a), false),
            AccountMeta::new(accounts.escrow, false),
            AccountMeta::new(accounts.vault, false),
            AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
            AccountMeta::new(task_queue, false),
            AccountMeta::new_readonly(registration, false),
            AccountMeta::new(task, false),
            AccountMeta::new(queue_authority, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            AccountMeta::new_readonly(TASK_QUEUE_PROGRAM_ID, false),
        ],
    )
}

pub fn take(taker: Pubkey, accounts: &EscrowAccounts) -> Instruction {
    Instruction::new_bare(
        ESCROW_PROGRAM_ID,
        TAKE,
        vec![
            AccountMeta::new(taker, true),
            AccountMeta::new(accounts.maker, false),
            AccountMeta::new_readonly(accounts.mint_a, false),
            AccountMeta::new_readonly(accounts.mint_b, false),
            AccountMeta::new(associated_token_address(&taker, &accounts.mint_a), false),
            AccountMeta::new(associated_token_address(&taker, &accounts.mint_b), false),
            AccountMeta::new(associated_token_address(&accounts.maker, &accounts.mint_b), false),
            AccountMeta::new(accounts.escrow, false),
            AccountMeta::new(accounts.vault, false),
            AccountMeta::new_readonly(ASSOCIATED_TOKEN_PROGRAM_ID, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
    )
}

/// Refund needs no signature, so anyone (including a task) may submit it
pub fn refund(accounts: &EscrowAccounts) -> Instruction {
    Instruction::new_bare(
        ESCROW_PROGRAM_ID,
        REFUND,
        vec![
            AccountMeta::new(accounts.maker, false),
            AccountMeta::new_readonly(accounts.mint_a, false),
            AccountMeta::new(associated_token_address(&accounts.maker, &accounts.mint_a), false),
            AccountMeta::new(accounts.escrow, false),
            AccountMeta::new(accounts.vault, false),
            AccountMeta::new_readonly(TOKEN_PROGRAM_ID, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
    )
}
