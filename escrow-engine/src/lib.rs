//! Two-party token escrow with crank-driven automatic refunds
//!
//! This crate implements the escrow program and the client side around it:
//! - `processor`: the escrow state machine (make, take, refund)
//! - `cranker`: an incentivized executor for matured refund tasks
//! - `node`: high-level API that derives addresses and allocates task slots
//! - `settings` and `telemetry`: configuration loading and tracing setup
//!
//! Refunds are scheduled on the task queue from `escrow-queue` in the same
//! transaction that creates the escrow.

pub mod cranker;
pub mod instruction;
pub mod node;
pub mod processor;
pub mod settings;
pub mod state;
pub mod telemetry;

use escrow_core::{ProgramRegistry, Pubkey};
use escrow_queue::TaskQueueProgram;
use std::sync::Arc;

pub use cranker::{CrankOutcome, Cranker, CrankerConfig};
pub use node::{EscrowInfo, EscrowNode, EscrowNodeConfig, EscrowStatus, MadeEscrow, MakeEscrowRequest};
pub use processor::EscrowProgram;
pub use settings::Settings;
pub use state::Escrow;

pub const ESCROW_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("3guFRQANk2kcU4LQVekbw7T8iF1jts85FDuz8JzQEjvp");

/// Registry with the escrow and task queue programs
pub fn program_registry() -> ProgramRegistry {
    ProgramRegistry::new()
        .with_program(Arc::new(EscrowProgram::new()))
        .with_program(Arc::new(TaskQueueProgram::new()))
}
