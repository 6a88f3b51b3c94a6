//! Main Escrow Node - High-level API for the escrow system
//!
//! Derives every address, picks a free task slot for the refund and retries
//! when another creator claims the same slot first. Wallet loading and RPC
//! plumbing sit on top of this API.

use crate::{
    instruction::{self, EscrowAccounts, MakeArgs},
    state::Escrow,
    telemetry, ESCROW_PROGRAM_ID,
};
use chrono::{DateTime, Utc};
use escrow_core::{
    address::{escrow_address, queue_authority_address},
    EscrowError, EscrowResult, Ledger, Pubkey, TransactionReceipt,
};
use escrow_queue::{QueueSnapshot, Task, TaskQueueClient};
use tracing::{info, warn};

/// Configuration for the escrow node
#[derive(Debug, Clone)]
pub struct EscrowNodeConfig {
    /// Queue that receives refund tasks
    pub task_queue: Pubkey,
    /// Attempts at `make` when the chosen slot is taken concurrently
    pub max_allocation_attempts: u32,
}

impl EscrowNodeConfig {
    pub fn new(task_queue: Pubkey) -> Self {
        Self {
            task_queue,
            max_allocation_attempts: 5,
        }
    }
}

/// Escrow creation request
#[derive(Debug, Clone)]
pub struct MakeEscrowRequest {
    pub maker: Pubkey,
    pub mint_a: Pubkey,
    pub mint_b: Pubkey,
    pub seed: u64,
    pub deposit: u64,
    pub receive: u64,
    pub expiry: i64,
}

/// Result of a successful `make`
#[derive(Debug, Clone)]
pub struct MadeEscrow {
    pub escrow: Pubkey,
    pub vault: Pubkey,
    pub task_id: u16,
    pub task: Pubkey,
    pub receipt: TransactionReceipt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowStatus {
    /// Waiting for a taker
    Active,
    /// Past expiry; anyone may refund
    Refundable,
}

/// Escrow information response
#[derive(Debug, Clone)]
pub struct EscrowInfo {
    pub address: Pubkey,
    pub escrow: Escrow,
    pub vault: Pubkey,
    pub vault_balance: u64,
    pub status: EscrowStatus,
    pub expires_at: Option<DateTime<Utc>>,
    /// `None` once the slot was cranked or reclaimed
    pub refund_task: Option<Task>,
}

/// Main escrow node
#[derive(Clone)]
pub struct EscrowNode {
    config: EscrowNodeConfig,
    ledger: Ledger,
    queue_client: TaskQueueClient,
}

impl EscrowNode {
    pub fn new(ledger: Ledger, config: EscrowNodeConfig) -> Self {
        info!(
            "Initializing escrow node for task queue {}",
            config.task_queue
        );
        Self {
            config,
            queue_client: TaskQueueClient::new(ledger.clone()),
            ledger,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn queue_client(&self) -> &TaskQueueClient {
        &self.queue_client
    }

    pub fn task_queue(&self) -> Pubkey {
        self.config.task_queue
    }

    /// Authority the escrow program enqueues refunds with; must be registered
    /// on the task queue before the first `make`
    pub fn queue_authority() -> Pubkey {
        queue_authority_address(&ESCROW_PROGRAM_ID).0
    }

    pub fn escrow_address(maker: &Pubkey, seed: u64) -> Pubkey {
        escrow_address(&ESCROW_PROGRAM_ID, maker, seed).0
    }

    pub async fn queue_snapshot(&self) -> EscrowResult<QueueSnapshot> {
        self.queue_client.fetch_queue(&self.config.task_queue).await
    }

    /// Create an escrow, allocating the lowest free refund slot.
    ///
    /// Retries with a fresh slot when the chosen one is taken between the
    /// queue read and the commit.
    pub async fn make(&self, request: MakeEscrowRequest) -> EscrowResult<MadeEscrow> {
        let attempts = self.config.max_allocation_attempts.max(1);
        let mut attempt = 1;
        loop {
            let snapshot = self.queue_snapshot().await?;
            // A full queue has no hint; submit anyway so the program reports it
            let task_id = snapshot.next_available_id.unwrap_or(0);

            match self.make_with_task_id(&request, task_id).await {
                Err(EscrowError::SlotOccupied { task_id, .. }) if attempt < attempts => {
                    warn!(
                        "Refund slot {} was taken concurrently, retrying (attempt {}/{})",
                        task_id, attempt, attempts
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Create an escrow with its refund task in slot `task_id`
    pub async fn make_with_task_id(
        &self,
        request: &MakeEscrowRequest,
        task_id: u16,
    ) -> EscrowResult<MadeEscrow> {
        let accounts =
            EscrowAccounts::derive(request.maker, request.mint_a, request.mint_b, request.seed);
        let ix = instruction::make(
            &accounts,
            self.config.task_queue,
            &MakeArgs {
                seed: request.seed,
                deposit: request.deposit,
                receive: request.receive,
                task_id,
                expiry: request.expiry,
            },
        )?;

        let receipt = self
            .ledger
            .process_transaction(&[ix], &[request.maker])
            .await?;

        telemetry::escrow_made(
            &accounts.escrow,
            &self.config.task_queue,
            task_id,
            request.expiry,
        );
        Ok(MadeEscrow {
            escrow: accounts.escrow,
            vault: accounts.vault,
            task_id,
            task: self.queue_client.task_address(&self.config.task_queue, task_id),
            receipt,
        })
    }

    pub async fn fetch_escrow(&self, address: &Pubkey) -> EscrowResult<Option<Escrow>> {
        self.ledger.fetch(address).await
    }

    async fn require_escrow(&self, address: &Pubkey) -> EscrowResult<Escrow> {
        self.fetch_escrow(address)
            .await?
            .ok_or(EscrowError::EscrowNotFound { address: *address })
    }

    /// Accept the trade: pay `receive` of mint B and collect the deposit
    pub async fn take(&self, taker: &Pubkey, escrow: &Pubkey) -> EscrowResult<TransactionReceipt> {
        let state = self.require_escrow(escrow).await?;
        let accounts = EscrowAccounts::derive(state.maker, state.mint_a, state.mint_b, state.seed);
        let ix = instruction::take(*taker, &accounts);
        self.ledger.process_transaction(&[ix], &[*taker]).await
    }

    /// Return the deposit to the maker; allowed from expiry on, by anyone
    pub async fn refund(&self, escrow: &Pubkey) -> EscrowResult<TransactionReceipt> {
        let state = self.require_escrow(escrow).await?;
        let accounts = EscrowAccounts::derive(state.maker, state.mint_a, state.mint_b, state.seed);
        let ix = instruction::refund(&accounts);
        self.ledger.process_transaction(&[ix], &[]).await
    }

    /// Get escrow information with its vault and refund task
    pub async fn escrow_info(&self, address: &Pubkey) -> EscrowResult<EscrowInfo> {
        let escrow = self.require_escrow(address).await?;
        let accounts =
            EscrowAccounts::derive(escrow.maker, escrow.mint_a, escrow.mint_b, escrow.seed);
        let vault_balance = self.ledger.token_balance(&accounts.vault).await?;
        let now = self.ledger.unix_timestamp().await;

        let refund_task = self
            .queue_client
            .fetch_task_by_id(&escrow.task_queue, escrow.task_id)
            .await?
            .filter(|task| task.payload.transaction.accounts.contains(address));

        Ok(EscrowInfo {
            address: *address,
            vault: accounts.vault,
            vault_balance,
            status: if now >= escrow.expiry {
                EscrowStatus::Refundable
            } else {
                EscrowStatus::Active
            },
            expires_at: DateTime::from_timestamp(escrow.expiry, 0),
            refund_task,
            escrow,
        })
    }
}
