//! Escrow Core - execution environment for the escrow workspace
//!
//! An in-process ledger of accounts with a clock, built-in token accounts,
//! atomic transactions and cross-program invocation, plus the address
//! derivations and the transaction compiler shared by the task queue and
//! escrow programs.

pub mod account;
pub mod address;
pub mod compiler;
pub mod error;
pub mod instruction;
pub mod ledger;
pub mod runtime;
pub mod token;

pub use account::{rent_exempt_minimum, Account, AccountState};
pub use compiler::{compile_transaction, CompiledInstruction, CompiledTransaction};
pub use error::{EscrowError, EscrowResult, Recovery};
pub use instruction::{AccountMeta, Instruction};
pub use ledger::{Ledger, LedgerState, ProgramEvent, TransactionReceipt};
pub use runtime::{AccountCursor, InvokeContext, Program, ProgramRegistry};
pub use solana_pubkey::Pubkey;
pub use token::{Mint, TokenAccount};
