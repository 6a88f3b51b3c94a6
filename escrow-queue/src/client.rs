//! Client for the task queue program
//!
//! Builds instructions, submits them to a [`Ledger`] and reads queue and
//! task state back.

use crate::{
    instruction::{self, InitializeTaskQueueArgs, QueueTaskArgs, UpdateTaskQueueArgs},
    state::{QueueConfig, Task, TaskBitmap, TaskQueue},
    TASK_QUEUE_PROGRAM_ID,
};
use escrow_core::{
    address::{queue_config_address, task_address, task_queue_address},
    EscrowError, EscrowResult, Ledger, Pubkey, TransactionReceipt,
};
use tracing::{debug, info};

/// Parameters for a new task queue
#[derive(Debug, Clone)]
pub struct TaskQueueParams {
    pub name: String,
    pub capacity: u16,
    pub min_crank_reward: u64,
    pub stale_task_age: u32,
    pub max_transaction_size: u32,
}

impl Default for TaskQueueParams {
    fn default() -> Self {
        Self {
            name: "escrow-refunds".to_string(),
            capacity: 100,
            min_crank_reward: 10_000,
            stale_task_age: 3_600,
            max_transaction_size: 1_024,
        }
    }
}

/// Point-in-time view of a task queue
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub address: Pubkey,
    pub name: String,
    pub capacity: u16,
    pub bitmap: TaskBitmap,
    pub live: u16,
    /// Lowest free slot when the snapshot was taken. Another creator may
    /// claim it first.
    pub next_available_id: Option<u16>,
    pub min_crank_reward: u64,
    pub stale_task_age: u32,
    pub max_transaction_size: u32,
    pub update_authority: Pubkey,
}

impl QueueSnapshot {
    fn from_queue(address: Pubkey, queue: TaskQueue) -> Self {
        Self {
            address,
            live: queue.task_bitmap.count_set(),
            next_available_id: queue.task_bitmap.first_free(),
            name: queue.name,
            capacity: queue.capacity,
            bitmap: queue.task_bitmap,
            min_crank_reward: queue.min_crank_reward,
            stale_task_age: queue.stale_task_age,
            max_transaction_size: queue.max_transaction_size,
            update_authority: queue.update_authority,
        }
    }

    pub fn is_full(&self) -> bool {
        self.bitmap.is_full()
    }
}

#[derive(Clone)]
pub struct TaskQueueClient {
    ledger: Ledger,
}

impl TaskQueueClient {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config_address(&self) -> Pubkey {
        queue_config_address(&TASK_QUEUE_PROGRAM_ID).0
    }

    pub fn task_address(&self, task_queue: &Pubkey, id: u16) -> Pubkey {
        task_address(&TASK_QUEUE_PROGRAM_ID, task_queue, id).0
    }

    pub async fn fetch_config(&self) -> EscrowResult<Option<QueueConfig>> {
        self.ledger.fetch(&self.config_address()).await
    }

    pub async fn initialize_config(
        &self,
        payer: &Pubkey,
        authority: &Pubkey,
        min_deposit: u64,
    ) -> EscrowResult<Pubkey> {
        let ix = instruction::initialize_queue_config(*payer, *authority, min_deposit)?;
        self.ledger
            .process_transaction(&[ix], &[*payer, *authority])
            .await?;
        Ok(self.config_address())
    }

    /// Create a task queue, paying its rent and the configured deposit
    pub async fn create_queue(
        &self,
        payer: &Pubkey,
        update_authority: &Pubkey,
        params: &TaskQueueParams,
    ) -> EscrowResult<Pubkey> {
        let config = self
            .fetch_config()
            .await?
            .ok_or_else(|| EscrowError::config("task queue config is not initialized"))?;
        let queue_id = config.next_task_queue_id;
        let args = InitializeTaskQueueArgs {
            name: params.name.clone(),
            capacity: params.capacity,
            min_crank_reward: params.min_crank_reward,
            stale_task_age: params.stale_task_age,
            max_transaction_size: params.max_transaction_size,
        };
        let ix = instruction::initialize_task_queue(*payer, *update_authority, queue_id, &args)?;
        self.ledger.process_transaction(&[ix], &[*payer]).await?;

        let (address, _) = task_queue_address(&TASK_QUEUE_PROGRAM_ID, &self.config_address(), queue_id);
        info!("Created task queue {} ({})", address, params.name);
        Ok(address)
    }

    pub async fn update_queue(
        &self,
        update_authority: &Pubkey,
        task_queue: &Pubkey,
        args: &UpdateTaskQueueArgs,
    ) -> EscrowResult<TransactionReceipt> {
        let ix = instruction::update_task_queue(*update_authority, *task_queue, args)?;
        self.ledger
            .process_transaction(&[ix], &[*update_authority])
            .await
    }

    pub async fn add_queue_authority(
        &self,
        payer: &Pubkey,
        update_authority: &Pubkey,
        task_queue: &Pubkey,
        queue_authority: &Pubkey,
    ) -> EscrowResult<TransactionReceipt> {
        let ix = instruction::add_queue_authority(*payer, *update_authority, *task_queue, *queue_authority);
        self.ledger
            .process_transaction(&[ix], &[*payer, *update_authority])
            .await
    }

    pub async fn remove_queue_authority(
        &self,
        rent_refund: &Pubkey,
        update_authority: &Pubkey,
        task_queue: &Pubkey,
        queue_authority: &Pubkey,
    ) -> EscrowResult<TransactionReceipt> {
        let ix = instruction::remove_queue_authority(
            *rent_refund,
            *update_authority,
            *task_queue,
            *queue_authority,
        );
        self.ledger
            .process_transaction(&[ix], &[*update_authority])
            .await
    }

    pub async fn fetch_queue(&self, task_queue: &Pubkey) -> EscrowResult<QueueSnapshot> {
        let queue: TaskQueue = self
            .ledger
            .fetch(task_queue)
            .await?
            .ok_or(EscrowError::AccountNotFound {
                address: *task_queue,
            })?;
        Ok(QueueSnapshot::from_queue(*task_queue, queue))
    }

    pub async fn fetch_task(&self, task: &Pubkey) -> EscrowResult<Option<Task>> {
        self.ledger.fetch(task).await
    }

    pub async fn fetch_task_by_id(&self, task_queue: &Pubkey, id: u16) -> EscrowResult<Option<Task>> {
        self.fetch_task(&self.task_address(task_queue, id)).await
    }

    /// Enqueue a task signed directly by `queue_authority`
    pub async fn enqueue(
        &self,
        task_queue: &Pubkey,
        payer: &Pubkey,
        queue_authority: &Pubkey,
        args: &QueueTaskArgs,
    ) -> EscrowResult<Pubkey> {
        let ix = instruction::queue_task(*payer, *queue_authority, *task_queue, args)?;
        self.ledger
            .process_transaction(&[ix], &[*payer, *queue_authority])
            .await?;
        Ok(self.task_address(task_queue, args.id))
    }

    /// Execute task `id`, paying its reward to `crank_turner`
    pub async fn crank(
        &self,
        task_queue: &Pubkey,
        id: u16,
        crank_turner: &Pubkey,
    ) -> EscrowResult<TransactionReceipt> {
        let task = self
            .fetch_task_by_id(task_queue, id)
            .await?
            .ok_or(EscrowError::TaskNotFound {
                queue: *task_queue,
                task_id: id,
            })?;
        let ix = instruction::run_task(
            *crank_turner,
            task.rent_refund,
            *task_queue,
            id,
            &task.payload.remaining_accounts,
        )?;
        debug!("Cranking task {} on {}", id, task_queue);
        self.ledger.process_transaction(&[ix], &[*crank_turner]).await
    }

    /// Reclaim a stale task; its lamports return to the task's rent refund
    pub async fn reclaim(&self, task_queue: &Pubkey, id: u16) -> EscrowResult<TransactionReceipt> {
        let task = self
            .fetch_task_by_id(task_queue, id)
            .await?
            .ok_or(EscrowError::TaskNotFound {
                queue: *task_queue,
                task_id: id,
            })?;
        let ix = instruction::reclaim_stale_task(task.rent_refund, *task_queue, id)?;
        self.ledger.process_transaction(&[ix], &[]).await
    }
}
