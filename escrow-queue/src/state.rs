//! Task queue account state

use escrow_core::{AccountMeta, AccountState, CompiledTransaction, EscrowResult, Pubkey};
use serde::{Deserialize, Serialize};

/// Program-wide configuration, initialized once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub authority: Pubkey,
    /// Lamports a new queue must deposit to fund follow-on tasks
    pub min_deposit: u64,
    pub next_task_queue_id: u32,
    pub bump: u8,
}

impl AccountState for QueueConfig {
    const NAME: &'static str = "QueueConfig";
}

/// Occupancy flags, one bit per slot, LSB first within each byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBitmap {
    capacity: u16,
    bits: Vec<u8>,
}

#[inline]
fn read_bit(byte: u8, n: u8) -> bool {
    (byte >> n) & 1 == 1
}

impl TaskBitmap {
    pub fn new(capacity: u16) -> Self {
        Self {
            capacity,
            bits: vec![0; (capacity as usize).div_ceil(8)],
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Whether slot `id` is occupied; out-of-range ids read as free
    pub fn is_set(&self, id: u16) -> bool {
        id < self.capacity && read_bit(self.bits[id as usize / 8], (id % 8) as u8)
    }

    pub fn set(&mut self, id: u16) {
        if id < self.capacity {
            self.bits[id as usize / 8] |= 1 << (id % 8);
        }
    }

    pub fn clear(&mut self, id: u16) {
        if id < self.capacity {
            self.bits[id as usize / 8] &= !(1 << (id % 8));
        }
    }

    pub fn count_set(&self) -> u16 {
        self.bits.iter().map(|b| b.count_ones() as u16).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_set() >= self.capacity
    }

    /// Lowest free slot
    pub fn first_free(&self) -> Option<u16> {
        self.free_ids().next()
    }

    pub fn free_ids(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.capacity).filter(|id| !self.is_set(*id))
    }

    pub fn occupied_ids(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.capacity).filter(|id| self.is_set(*id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueue {
    pub id: u32,
    pub queue_config: Pubkey,
    pub update_authority: Pubkey,
    pub name: String,
    pub capacity: u16,
    pub min_crank_reward: u64,
    /// Seconds past eligibility after which a task may be reclaimed
    pub stale_task_age: u32,
    /// Largest serialized payload a task may carry
    pub max_transaction_size: u32,
    pub num_queue_authorities: u16,
    pub task_bitmap: TaskBitmap,
    pub created_at: i64,
    pub updated_at: i64,
    pub bump: u8,
}

impl AccountState for TaskQueue {
    const NAME: &'static str = "TaskQueue";
}

/// Registration allowing `queue_authority` to enqueue on `task_queue`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueAuthority {
    pub task_queue: Pubkey,
    pub queue_authority: Pubkey,
    pub bump: u8,
}

impl AccountState for TaskQueueAuthority {
    const NAME: &'static str = "TaskQueueAuthority";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueNameMapping {
    pub task_queue: Pubkey,
    pub name: String,
    pub bump: u8,
}

impl AccountState for TaskQueueNameMapping {
    const NAME: &'static str = "TaskQueueNameMapping";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Now,
    Timestamp(i64),
}

impl Trigger {
    /// First unix timestamp at which a task queued at `queued_at` may run.
    /// A timestamp already in the past counts from the time of queueing.
    pub fn eligible_at(&self, queued_at: i64) -> i64 {
        match self {
            Trigger::Now => queued_at,
            Trigger::Timestamp(ts) => (*ts).max(queued_at),
        }
    }
}

/// Compiled instructions plus the accounts resolved when the task runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub transaction: CompiledTransaction,
    pub remaining_accounts: Vec<AccountMeta>,
}

impl TaskPayload {
    pub fn new(transaction: CompiledTransaction, remaining_accounts: Vec<AccountMeta>) -> Self {
        Self {
            transaction,
            remaining_accounts,
        }
    }

    /// Serialized size checked against the queue's transaction limit
    pub fn size(&self) -> EscrowResult<usize> {
        Ok(bincode::serialized_size(self)? as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_queue: Pubkey,
    pub id: u16,
    pub trigger: Trigger,
    pub payload: TaskPayload,
    pub description: String,
    pub crank_reward: u64,
    /// Rent locked in the task account on creation
    pub rent_amount: u64,
    /// Receives everything but the reward when the task is closed
    pub rent_refund: Pubkey,
    /// Follow-on tasks the payload may queue when it runs
    pub free_tasks: u8,
    pub queued_at: i64,
    pub bump: u8,
}

impl AccountState for Task {
    const NAME: &'static str = "Task";
}

impl Task {
    pub fn eligible_at(&self) -> i64 {
        self.trigger.eligible_at(self.queued_at)
    }

    pub fn is_eligible(&self, now: i64) -> bool {
        now >= self.eligible_at()
    }

    /// Seconds since the task became eligible, negative before that
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.eligible_at())
    }
}

/// A follow-on task requested by a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReturn {
    pub trigger: Trigger,
    pub payload: TaskPayload,
    pub crank_reward: Option<u64>,
    pub free_tasks: u8,
    pub description: String,
}

/// Return data a payload instruction sets to chain follow-on tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskReturn {
    pub tasks: Vec<TaskReturn>,
}

impl AccountState for RunTaskReturn {
    const NAME: &'static str = "RunTaskReturn";
}
