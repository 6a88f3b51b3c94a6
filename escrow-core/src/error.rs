//! Error types for the escrow system
//!
//! A single taxonomy shared by the execution environment, the task queue
//! program and the escrow program. Every variant carries the precondition
//! that failed so an external tool can decide whether to retry, reclaim or
//! abandon.

use solana_pubkey::Pubkey;
use thiserror::Error;

/// Main error type for escrow and task queue operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscrowError {
    /// A lamport or token balance is short
    #[error("Insufficient funds in {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: Pubkey,
        required: u64,
        available: u64,
    },

    /// An escrow already exists for this (maker, seed)
    #[error("Escrow {address} already exists")]
    DuplicateEscrow { address: Pubkey },

    /// Never created, already taken or already refunded
    #[error("Escrow {address} not found")]
    EscrowNotFound { address: Pubkey },

    /// Refund attempted before the escrow expiry
    #[error("Refund not allowed before {expiry} (now {now})")]
    RefundNotYetAllowed { now: i64, expiry: i64 },

    /// Every slot of the queue is occupied
    #[error("Task queue {queue} is full ({capacity} slots occupied)")]
    QueueFull { queue: Pubkey, capacity: u16 },

    /// The requested slot was taken between read and commit
    #[error("Task slot {task_id} on queue {queue} is already occupied")]
    SlotOccupied { queue: Pubkey, task_id: u16 },

    /// Caller lacks the authority for this operation
    #[error("{caller} is not authorized: {reason}")]
    Unauthorized { caller: Pubkey, reason: String },

    /// Task cranked before its trigger matured
    #[error("Task {task_id} trigger not met: eligible at {eligible_at}, now {now}")]
    TriggerNotMet {
        task_id: u16,
        eligible_at: i64,
        now: i64,
    },

    /// Slot is free or the task account is gone
    #[error("Task {task_id} not found on queue {queue}")]
    TaskNotFound { queue: Pubkey, task_id: u16 },

    /// Stale reclamation attempted too early
    #[error("Task {task_id} is not stale yet: age {age}s, stale after {stale_after}s")]
    StaleThresholdNotReached {
        task_id: u16,
        age: i64,
        stale_after: u32,
    },

    /// Argument validation errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Task id outside the queue capacity
    #[error("Task id {task_id} is outside queue capacity {capacity}")]
    InvalidTaskId { task_id: u16, capacity: u16 },

    /// Compiled payload exceeds the queue limit
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Account {address} not found")]
    AccountNotFound { address: Pubkey },

    #[error("Account {address} already exists")]
    AccountAlreadyExists { address: Pubkey },

    /// Account failed a derivation, ownership or has-one check
    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Missing required signature for {account}")]
    MissingSignature { account: Pubkey },

    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),

    #[error("Unknown program {program_id}")]
    UnknownProgram { program_id: Pubkey },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for escrow and task queue operations
pub type EscrowResult<T> = Result<T, EscrowError>;

/// What an external actor should do after a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Same call may succeed later without changes
    RetryLater,
    /// Pick another free slot and resubmit
    RetryWithNewSlot,
    /// The payload can never succeed; reclaim the task once stale
    ReclaimWhenStale,
    /// Nothing to retry
    Abandon,
}

impl EscrowError {
    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(caller: Pubkey, reason: S) -> Self {
        Self::Unauthorized {
            caller,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid account error
    pub fn invalid_account<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAccount(msg.into())
    }

    /// Create an invalid instruction error
    pub fn invalid_instruction<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInstruction(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify the failure for crankers and task creators.
    ///
    /// A crank whose refund payload fails with `EscrowNotFound` or
    /// `RefundNotYetAllowed` will keep failing, so the task should be left
    /// for stale reclamation rather than retried.
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::TriggerNotMet { .. }
            | Self::StaleThresholdNotReached { .. }
            | Self::QueueFull { .. } => Recovery::RetryLater,
            Self::SlotOccupied { .. } => Recovery::RetryWithNewSlot,
            Self::EscrowNotFound { .. } | Self::RefundNotYetAllowed { .. } => {
                Recovery::ReclaimWhenStale
            }
            _ => Recovery::Abandon,
        }
    }
}

impl From<bincode::Error> for EscrowError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
