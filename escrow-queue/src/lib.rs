//! Escrow Queue - fixed-capacity deferred task queue
//!
//! Programs register deferred calls ("tasks") in a slot of a task queue.
//! Each task carries a trigger and a compiled payload. Once the trigger
//! matures any cranker may execute the payload; the slot is freed and the
//! cranker paid in the same atomic step. Tasks that can never succeed are
//! reclaimed once stale.

pub mod client;
pub mod instruction;
pub mod processor;
pub mod state;

use escrow_core::Pubkey;

pub use client::{QueueSnapshot, TaskQueueClient, TaskQueueParams};
pub use instruction::{QueueTaskArgs, UpdateTaskQueueArgs};
pub use processor::TaskQueueProgram;
pub use state::{
    QueueConfig, RunTaskReturn, Task, TaskBitmap, TaskPayload, TaskQueue, TaskQueueAuthority,
    TaskQueueNameMapping, TaskReturn, Trigger,
};

pub const TASK_QUEUE_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("tuktukUrfhXT6ZT77QTU8RQtvgL967uRuVagWF57zVA");

/// Task ids are a single byte in the task address seeds
pub const MAX_QUEUE_CAPACITY: u16 = 256;

pub const MAX_DESCRIPTION_LEN: usize = 40;

pub const MAX_QUEUE_NAME_LEN: usize = 64;
