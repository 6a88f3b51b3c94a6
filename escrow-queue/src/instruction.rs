//! Instruction names, arguments and builders for the task queue program

use crate::{state::TaskPayload, state::Trigger, TASK_QUEUE_PROGRAM_ID};
use escrow_core::{
    address::{
        queue_config_address, task_address, task_queue_address, task_queue_authority_address,
        task_queue_name_mapping_address, SYSTEM_PROGRAM_ID,
    },
    AccountMeta, EscrowResult, Instruction, Pubkey,
};
use serde::{Deserialize, Serialize};

pub const INITIALIZE_QUEUE_CONFIG: &str = "initialize_queue_config";
pub const UPDATE_QUEUE_CONFIG: &str = "update_queue_config";
pub const INITIALIZE_TASK_QUEUE: &str = "initialize_task_queue";
pub const UPDATE_TASK_QUEUE: &str = "update_task_queue";
pub const ADD_QUEUE_AUTHORITY: &str = "add_queue_authority";
pub const REMOVE_QUEUE_AUTHORITY: &str = "remove_queue_authority";
pub const QUEUE_TASK: &str = "queue_task";
pub const RUN_TASK: &str = "run_task";
pub const RECLAIM_STALE_TASK: &str = "reclaim_stale_task";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeQueueConfigArgs {
    pub min_deposit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQueueConfigArgs {
    pub min_deposit: Option<u64>,
    pub authority: Option<Pubkey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeTaskQueueArgs {
    pub name: String,
    pub capacity: u16,
    pub min_crank_reward: u64,
    pub stale_task_age: u32,
    pub max_transaction_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskQueueArgs {
    pub min_crank_reward: Option<u64>,
    pub stale_task_age: Option<u32>,
    pub max_transaction_size: Option<u32>,
    pub update_authority: Option<Pubkey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTaskArgs {
    pub id: u16,
    pub trigger: Trigger,
    pub payload: TaskPayload,
    /// Defaults to the queue minimum
    pub crank_reward: Option<u64>,
    pub free_tasks: u8,
    pub description: String,
}

/// Identifies the task slot for `run_task` and `reclaim_stale_task`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdArgs {
    pub id: u16,
}

pub fn initialize_queue_config(
    payer: Pubkey,
    authority: Pubkey,
    min_deposit: u64,
) -> EscrowResult<Instruction> {
    let (config, _) = queue_config_address(&TASK_QUEUE_PROGRAM_ID);
    Instruction::new_with_args(
        TASK_QUEUE_PROGRAM_ID,
        INITIALIZE_QUEUE_CONFIG,
        &InitializeQueueConfigArgs { min_deposit },
        vec![
            AccountMeta::new(payer, true),
            AccountMeta::new_readonly(authority, true),
            AccountMeta::new(config, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
    )
}

pub fn update_queue_config(authority: Pubkey, args: &UpdateQueueConfigArgs) -> EscrowResult<Instruction> {
    let (config, _) = queue_config_address(&TASK_QUEUE_PROGRAM_ID);
    Instruction::new_with_args(
        TASK_QUEUE_PROGRAM_ID,
        UPDATE_QUEUE_CONFIG,
        args,
        vec![
            AccountMeta::new_readonly(authority, true),
            AccountMeta::new(config, false),
        ],
    )
}

/// `queue_id` must be the configuration's next task queue id
pub fn initialize_task_queue(
    payer: Pubkey,
    update_authority: Pubkey,
    queue_id: u32,
    args: &InitializeTaskQueueArgs,
) -> EscrowResult<Instruction> {
    let (config, _) = queue_config_address(&TASK_QUEUE_PROGRAM_ID);
    let (task_queue, _) = task_queue_address(&TASK_QUEUE_PROGRAM_ID, &config, queue_id);
    let (name_mapping, _) =
        task_queue_name_mapping_address(&TASK_QUEUE_PROGRAM_ID, &config, &args.name);
    Instruction::new_with_args(
        TASK_QUEUE_PROGRAM_ID,
        INITIALIZE_TASK_QUEUE,
        args,
        vec![
            AccountMeta::new(payer, true),
            AccountMeta::new(config, false),
            AccountMeta::new_readonly(update_authority, false),
            AccountMeta::new(task_queue, false),
            AccountMeta::new(name_mapping, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
    )
}

pub fn update_task_queue(
    update_authority: Pubkey,
    task_queue: Pubkey,
    args: &UpdateTaskQueueArgs,
) -> EscrowResult<Instruction> {
    Instruction::new_with_args(
        TASK_QUEUE_PROGRAM_ID,
        UPDATE_TASK_QUEUE,
        args,
        vec![
            AccountMeta::new_readonly(update_authority, true),
            AccountMeta::new(task_queue, false),
        ],
    )
}

pub fn add_queue_authority(
    payer: Pubkey,
    update_authority: Pubkey,
    task_queue: Pubkey,
    queue_authority: Pubkey,
) -> Instruction {
    let (registration, _) =
        task_queue_authority_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, &queue_authority);
    Instruction::new_bare(
        TASK_QUEUE_PROGRAM_ID,
        ADD_QUEUE_AUTHORITY,
        vec![
            AccountMeta::new(payer, true),
            AccountMeta::new_readonly(update_authority, true),
            AccountMeta::new_readonly(queue_authority, false),
            AccountMeta::new(task_queue, false),
            AccountMeta::new(registration, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
    )
}

pub fn remove_queue_authority(
    rent_refund: Pubkey,
    update_authority: Pubkey,
    task_queue: Pubkey,
    queue_authority: Pubkey,
) -> Instruction {
    let (registration, _) =
        task_queue_authority_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, &queue_authority);
    Instruction::new_bare(
        TASK_QUEUE_PROGRAM_ID,
        REMOVE_QUEUE_AUTHORITY,
        vec![
            AccountMeta::new(rent_refund, false),
            AccountMeta::new_readonly(update_authority, true),
            AccountMeta::new_readonly(queue_authority, false),
            AccountMeta::new(task_queue, false),
            AccountMeta::new(registration, false),
        ],
    )
}

/// Enqueue a task. `queue_authority` must be registered on `task_queue` and
/// sign, either directly or through a derived-address invocation.
pub fn queue_task(
    payer: Pubkey,
    queue_authority: Pubkey,
    task_queue: Pubkey,
    args: &QueueTaskArgs,
) -> EscrowResult<Instruction> {
    let (registration, _) =
        task_queue_authority_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, &queue_authority);
    let (task, _) = task_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, args.id);
    Instruction::new_with_args(
        TASK_QUEUE_PROGRAM_ID,
        QUEUE_TASK,
        args,
        vec![
            AccountMeta::new(payer, true),
            AccountMeta::new_readonly(queue_authority, true),
            AccountMeta::new(task_queue, false),
            AccountMeta::new_readonly(registration, false),
            AccountMeta::new(task, false),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
    )
}

/// Crank task `id`. `remaining_accounts` resolve the payload's indices past
/// its embedded account table.
pub fn run_task(
    crank_turner: Pubkey,
    rent_refund: Pubkey,
    task_queue: Pubkey,
    id: u16,
    remaining_accounts: &[AccountMeta],
) -> EscrowResult<Instruction> {
    let (task, _) = task_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, id);
    let mut accounts = vec![
        AccountMeta::new(crank_turner, true),
        AccountMeta::new(rent_refund, false),
        AccountMeta::new(task_queue, false),
        AccountMeta::new(task, false),
        AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
    ];
    accounts.extend(remaining_accounts.iter().map(|meta| AccountMeta {
        is_signer: false,
        ..*meta
    }));
    Instruction::new_with_args(TASK_QUEUE_PROGRAM_ID, RUN_TASK, &TaskIdArgs { id }, accounts)
}

pub fn reclaim_stale_task(rent_refund: Pubkey, task_queue: Pubkey, id: u16) -> EscrowResult<Instruction> {
    let (task, _) = task_address(&TASK_QUEUE_PROGRAM_ID, &task_queue, id);
    Instruction::new_with_args(
        TASK_QUEUE_PROGRAM_ID,
        RECLAIM_STALE_TASK,
        &TaskIdArgs { id },
        vec![
            AccountMeta::new(rent_refund, false),
            AccountMeta::new(task_queue, false),
            AccountMeta::new(task, false),
        ],
    )
}
