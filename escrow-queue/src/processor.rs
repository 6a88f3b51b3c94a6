//! Task queue program
//!
//! Slot allocation, trigger evaluation, crank execution and stale
//! reclamation. Every handler validates against the queue state loaded
//! inside the transaction, so occupancy checks happen at commit time.

use crate::{
    instruction::{
        InitializeQueueConfigArgs, InitializeTaskQueueArgs, QueueTaskArgs, TaskIdArgs,
        UpdateQueueConfigArgs, UpdateTaskQueueArgs, ADD_QUEUE_AUTHORITY, INITIALIZE_QUEUE_CONFIG,
        INITIALIZE_TASK_QUEUE, QUEUE_TASK, RECLAIM_STALE_TASK, REMOVE_QUEUE_AUTHORITY, RUN_TASK,
        UPDATE_QUEUE_CONFIG, UPDATE_TASK_QUEUE,
    },
    state::{
        QueueConfig, RunTaskReturn, Task, TaskBitmap, TaskPayload, TaskQueue, TaskQueueAuthority,
        TaskQueueNameMapping, Trigger,
    },
    MAX_DESCRIPTION_LEN, MAX_QUEUE_CAPACITY, MAX_QUEUE_NAME_LEN, TASK_QUEUE_PROGRAM_ID,
};
use escrow_core::{
    address::{
        instruction_discriminator, queue_config_address, task_address, task_queue_address,
        task_queue_authority_address, task_queue_name_mapping_address,
    },
    instruction::{decode_args, split_discriminator},
    rent_exempt_minimum, AccountCursor, AccountMeta, AccountState, EscrowError, EscrowResult,
    InvokeContext, Program, Pubkey,
};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
struct TaskQueuedEvent {
    task_queue: Pubkey,
    task: Pubkey,
    id: u16,
    eligible_at: i64,
    crank_reward: u64,
    description: String,
}

#[derive(Debug, Clone, Serialize)]
struct TaskRanEvent {
    task_queue: Pubkey,
    task: Pubkey,
    id: u16,
    crank_turner: Pubkey,
    crank_reward: u64,
    follow_on_ids: Vec<u16>,
}

#[derive(Debug, Clone, Serialize)]
struct TaskReclaimedEvent {
    task_queue: Pubkey,
    task: Pubkey,
    id: u16,
    age: i64,
    rent_refund: Pubkey,
    lamports: u64,
}

#[derive(Debug, Clone, Serialize)]
struct TaskQueueInitializedEvent {
    task_queue: Pubkey,
    id: u32,
    name: String,
    capacity: u16,
}

/// Who funds a new task account
enum TaskFunding {
    /// A signer pays rent and reward and receives the rent back
    Payer(Pubkey),
    /// Follow-on tasks draw on the queue's own deposit
    QueueDeposit { rent_refund: Pubkey },
}

/// Fields of a task about to be placed in a slot
struct NewTask {
    id: u16,
    trigger: Trigger,
    payload: TaskPayload,
    crank_reward: Option<u64>,
    free_tasks: u8,
    description: String,
}

pub struct TaskQueueProgram;

impl TaskQueueProgram {
    pub fn new() -> Self {
        Self
    }

    fn initialize_queue_config(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        args: InitializeQueueConfigArgs,
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let payer = cursor.next_signer()?.pubkey;
        let authority = cursor.next_signer()?.pubkey;
        let (expected, bump) = queue_config_address(&ctx.program_id());
        let config = cursor.next_address(&expected)?.pubkey;

        if ctx.account_exists(&config) {
            return Err(EscrowError::AccountAlreadyExists { address: config });
        }

        info!(
            "Initializing queue config {} with authority {} and min deposit {}",
            config, authority, args.min_deposit
        );
        ctx.create_account(
            &payer,
            &config,
            &QueueConfig {
                authority,
                min_deposit: args.min_deposit,
                next_task_queue_id: 0,
                bump,
            },
        )
    }

    fn update_queue_config(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        args: UpdateQueueConfigArgs,
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let authority = cursor.next_signer()?.pubkey;
        let (expected, _) = queue_config_address(&ctx.program_id());
        let config_key = cursor.next_address(&expected)?.pubkey;

        let mut config: QueueConfig = ctx.load_owned(&config_key)?;
        if config.authority != authority {
            return Err(EscrowError::unauthorized(
                authority,
                "not the queue config authority",
            ));
        }
        if let Some(min_deposit) = args.min_deposit {
            config.min_deposit = min_deposit;
        }
        if let Some(new_authority) = args.authority {
            config.authority = new_authority;
        }

        info!("Updated queue config {}", config_key);
        ctx.store(&config_key, &config)
    }

    fn initialize_task_queue(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        args: InitializeTaskQueueArgs,
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let payer = cursor.next_signer()?.pubkey;
        let (config_address, _) = queue_config_address(&ctx.program_id());
        let config_key = cursor.next_address(&config_address)?.pubkey;
        let update_authority = cursor.next()?.pubkey;

        Self::validate_queue_args(&args)?;

        let mut config: QueueConfig = ctx.load_owned(&config_key)?;
        let (queue_address, queue_bump) =
            task_queue_address(&ctx.program_id(), &config_key, config.next_task_queue_id);
        let task_queue = cursor.next_address(&queue_address)?.pubkey;
        let (mapping_address, mapping_bump) =
            task_queue_name_mapping_address(&ctx.program_id(), &config_key, &args.name);
        let name_mapping = cursor.next_address(&mapping_address)?.pubkey;

        if ctx.account_exists(&name_mapping) {
            return Err(EscrowError::invalid_argument(format!(
                "task queue name '{}' is taken",
                args.name
            )));
        }

        let now = ctx.unix_timestamp();
        let queue = TaskQueue {
            id: config.next_task_queue_id,
            queue_config: config_key,
            update_authority,
            name: args.name.clone(),
            capacity: args.capacity,
            min_crank_reward: args.min_crank_reward,
            stale_task_age: args.stale_task_age,
            max_transaction_size: args.max_transaction_size,
            num_queue_authorities: 0,
            task_bitmap: TaskBitmap::new(args.capacity),
            created_at: now,
            updated_at: now,
            bump: queue_bump,
        };
        ctx.create_account(&payer, &task_queue, &queue)?;
        ctx.transfer_lamports(&payer, &task_queue, config.min_deposit)?;
        ctx.create_account(
            &payer,
            &name_mapping,
            &TaskQueueNameMapping {
                task_queue,
                name: args.name.clone(),
                bump: mapping_bump,
            },
        )?;

        config.next_task_queue_id += 1;
        ctx.store(&config_key, &config)?;

        info!(
            "Created task queue {} '{}' with capacity {}",
            task_queue, args.name, args.capacity
        );
        ctx.emit(
            "task_queue_initialized",
            &TaskQueueInitializedEvent {
                task_queue,
                id: queue.id,
                name: args.name,
                capacity: args.capacity,
            },
        )
    }

    fn validate_queue_args(args: &InitializeTaskQueueArgs) -> EscrowResult<()> {
        if args.capacity == 0 || args.capacity > MAX_QUEUE_CAPACITY {
            return Err(EscrowError::invalid_argument(format!(
                "capacity must be between 1 and {}, got {}",
                MAX_QUEUE_CAPACITY, args.capacity
            )));
        }
        if args.name.is_empty() || args.name.len() > MAX_QUEUE_NAME_LEN {
            return Err(EscrowError::invalid_argument(format!(
                "queue name must be 1 to {} bytes",
                MAX_QUEUE_NAME_LEN
            )));
        }
        if args.max_transaction_size == 0 {
            return Err(EscrowError::invalid_argument(
                "max transaction size must be positive",
            ));
        }
        Ok(())
    }

    fn load_queue_for_update(
        ctx: &InvokeContext<'_>,
        task_queue: &Pubkey,
        update_authority: &Pubkey,
    ) -> EscrowResult<TaskQueue> {
        let queue: TaskQueue = ctx.load_owned(task_queue)?;
        if queue.update_authority != *update_authority {
            return Err(EscrowError::unauthorized(
                *update_authority,
                format!("not the update authority of task queue {}", task_queue),
            ));
        }
        Ok(queue)
    }

    fn update_task_queue(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        args: UpdateTaskQueueArgs,
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let update_authority = cursor.next_signer()?.pubkey;
        let task_queue = cursor.next_writable()?.pubkey;

        let mut queue = Self::load_queue_for_update(ctx, &task_queue, &update_authority)?;
        if let Some(reward) = args.min_crank_reward {
            queue.min_crank_reward = reward;
        }
        if let Some(age) = args.stale_task_age {
            queue.stale_task_age = age;
        }
        if let Some(size) = args.max_transaction_size {
            if size == 0 {
                return Err(EscrowError::invalid_argument(
                    "max transaction size must be positive",
                ));
            }
            queue.max_transaction_size = size;
        }
        if let Some(authority) = args.update_authority {
            queue.update_authority = authority;
        }
        queue.updated_at = ctx.unix_timestamp();

        info!("Updated task queue {}", task_queue);
        ctx.store(&task_queue, &queue)
    }

    fn add_queue_authority(&self, ctx: &mut InvokeContext<'_>, accounts: &[AccountMeta]) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let payer = cursor.next_signer()?.pubkey;
        let update_authority = cursor.next_signer()?.pubkey;
        let queue_authority = cursor.next()?.pubkey;
        let task_queue = cursor.next_writable()?.pubkey;
        let (expected, bump) =
            task_queue_authority_address(&ctx.program_id(), &task_queue, &queue_authority);
        let registration = cursor.next_address(&expected)?.pubkey;

        let mut queue = Self::load_queue_for_update(ctx, &task_queue, &update_authority)?;
        ctx.create_account(
            &payer,
            &registration,
            &TaskQueueAuthority {
                task_queue,
                queue_authority,
                bump,
            },
        )?;
        queue.num_queue_authorities += 1;
        queue.updated_at = ctx.unix_timestamp();
        ctx.store(&task_queue, &queue)?;

        info!(
            "Registered queue authority {} on task queue {}",
            queue_authority, task_queue
        );
        Ok(())
    }

    fn remove_queue_authority(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let rent_refund = cursor.next_writable()?.pubkey;
        let update_authority = cursor.next_signer()?.pubkey;
        let queue_authority = cursor.next()?.pubkey;
        let task_queue = cursor.next_writable()?.pubkey;
        let (expected, _) =
            task_queue_authority_address(&ctx.program_id(), &task_queue, &queue_authority);
        let registration = cursor.next_address(&expected)?.pubkey;

        let mut queue = Self::load_queue_for_update(ctx, &task_queue, &update_authority)?;
        ctx.load_owned::<TaskQueueAuthority>(&registration)?;
        ctx.close_account(&registration, &rent_refund)?;
        queue.num_queue_authorities = queue.num_queue_authorities.saturating_sub(1);
        queue.updated_at = ctx.unix_timestamp();
        ctx.store(&task_queue, &queue)?;

        info!(
            "Removed queue authority {} from task queue {}",
            queue_authority, task_queue
        );
        Ok(())
    }

    fn queue_task(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        args: QueueTaskArgs,
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let payer = cursor.next_signer()?.pubkey;
        let queue_authority = cursor.next_signer()?.pubkey;
        let task_queue = cursor.next_writable()?.pubkey;
        let registration = cursor.next()?.pubkey;
        let task = cursor.next_writable()?.pubkey;

        let mut queue: TaskQueue = ctx.load_owned(&task_queue)?;

        let (expected_registration, _) =
            task_queue_authority_address(&ctx.program_id(), &task_queue, &queue_authority);
        let registered = registration == expected_registration
            && ctx
                .load_owned::<TaskQueueAuthority>(&registration)
                .map(|r| r.task_queue == task_queue && r.queue_authority == queue_authority)
                .unwrap_or(false);
        if !registered {
            return Err(EscrowError::unauthorized(
                queue_authority,
                format!("not a queue authority of task queue {}", task_queue),
            ));
        }

        Self::place_task(
            ctx,
            &task_queue,
            &mut queue,
            TaskFunding::Payer(payer),
            Some(task),
            NewTask {
                id: args.id,
                trigger: args.trigger,
                payload: args.payload,
                crank_reward: args.crank_reward,
                free_tasks: args.free_tasks,
                description: args.description,
            },
        )?;
        ctx.store(&task_queue, &queue)
    }

    /// Validate and create a task in slot `new.id`, marking the slot occupied
    /// in `queue`. The caller stores the queue.
    ///
    /// Checks run in a fixed order: capacity, slot range, occupancy, task
    /// address, reward, payload size, description.
    fn place_task(
        ctx: &mut InvokeContext<'_>,
        task_queue: &Pubkey,
        queue: &mut TaskQueue,
        funding: TaskFunding,
        supplied_task: Option<Pubkey>,
        new: NewTask,
    ) -> EscrowResult<Pubkey> {
        if queue.task_bitmap.is_full() {
            return Err(EscrowError::QueueFull {
                queue: *task_queue,
                capacity: queue.capacity,
            });
        }
        if new.id >= queue.capacity {
            return Err(EscrowError::InvalidTaskId {
                task_id: new.id,
                capacity: queue.capacity,
            });
        }
        if queue.task_bitmap.is_set(new.id) {
            return Err(EscrowError::SlotOccupied {
                queue: *task_queue,
                task_id: new.id,
            });
        }
        let (task_key, bump) = task_address(&ctx.program_id(), task_queue, new.id);
        if let Some(supplied) = supplied_task {
            if supplied != task_key {
                return Err(EscrowError::invalid_account(format!(
                    "task account {} does not match slot {}",
                    supplied, new.id
                )));
            }
        }

        let crank_reward = new.crank_reward.unwrap_or(queue.min_crank_reward);
        if crank_reward < queue.min_crank_reward {
            return Err(EscrowError::invalid_argument(format!(
                "crank reward {} is below the queue minimum {}",
                crank_reward, queue.min_crank_reward
            )));
        }
        let size = new.payload.size()?;
        if size > queue.max_transaction_size as usize {
            return Err(EscrowError::PayloadTooLarge {
                size,
                limit: queue.max_transaction_size as usize,
            });
        }
        if new.description.len() > MAX_DESCRIPTION_LEN {
            return Err(EscrowError::invalid_argument(format!(
                "description is {} bytes, at most {} allowed",
                new.description.len(),
                MAX_DESCRIPTION_LEN
            )));
        }

        let (payer, rent_refund) = match funding {
            TaskFunding::Payer(payer) => (payer, payer),
            TaskFunding::QueueDeposit { rent_refund } => (*task_queue, rent_refund),
        };
        let mut task = Task {
            task_queue: *task_queue,
            id: new.id,
            trigger: new.trigger,
            payload: new.payload,
            description: new.description,
            crank_reward,
            rent_amount: 0,
            rent_refund,
            free_tasks: new.free_tasks,
            queued_at: ctx.unix_timestamp(),
            bump,
        };
        // rent_amount is fixed width, so the placeholder encodes to the final size
        task.rent_amount = rent_exempt_minimum(task.to_account_data()?.len());

        if payer == *task_queue {
            let available = ctx.spendable_lamports(task_queue);
            let required = task.rent_amount + crank_reward;
            if available < required {
                return Err(EscrowError::InsufficientFunds {
                    account: *task_queue,
                    required,
                    available,
                });
            }
        }

        ctx.create_account(&payer, &task_key, &task)?;
        ctx.transfer_lamports(&payer, &task_key, crank_reward)?;
        queue.task_bitmap.set(new.id);
        queue.updated_at = ctx.unix_timestamp();

        info!(
            "Queued task {} in slot {} of {} (eligible at {})",
            task_key,
            new.id,
            task_queue,
            task.eligible_at()
        );
        ctx.emit(
            "task_queued",
            &TaskQueuedEvent {
                task_queue: *task_queue,
                task: task_key,
                id: task.id,
                eligible_at: task.eligible_at(),
                crank_reward,
                description: task.description.clone(),
            },
        )?;
        Ok(task_key)
    }

    /// Load the live task in slot `id`, failing with `TaskNotFound` when the
    /// slot is free or the account is gone
    fn load_live_task(
        ctx: &InvokeContext<'_>,
        task_queue: &Pubkey,
        queue: &TaskQueue,
        task_key: &Pubkey,
        id: u16,
    ) -> EscrowResult<Task> {
        let not_found = EscrowError::TaskNotFound {
            queue: *task_queue,
            task_id: id,
        };
        let (expected, _) = task_address(&ctx.program_id(), task_queue, id);
        if *task_key != expected || !queue.task_bitmap.is_set(id) || !ctx.account_exists(task_key) {
            return Err(not_found);
        }
        let task: Task = ctx.load_owned(task_key)?;
        if task.task_queue != *task_queue || task.id != id {
            return Err(not_found);
        }
        Ok(task)
    }

    fn run_task(&self, ctx: &mut InvokeContext<'_>, accounts: &[AccountMeta], args: TaskIdArgs) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let crank_turner = cursor.next_signer()?.pubkey;
        let rent_refund = cursor.next_writable()?.pubkey;
        let task_queue = cursor.next_writable()?.pubkey;
        let task_key = cursor.next_writable()?.pubkey;
        let _system_program = cursor.next()?;
        let supplied = cursor.remaining();

        let mut queue: TaskQueue = ctx.load_owned(&task_queue)?;
        let task = Self::load_live_task(ctx, &task_queue, &queue, &task_key, args.id)?;
        if task.rent_refund != rent_refund {
            return Err(EscrowError::invalid_account(format!(
                "rent refund must be {}, got {}",
                task.rent_refund, rent_refund
            )));
        }

        let now = ctx.unix_timestamp();
        if !task.is_eligible(now) {
            return Err(EscrowError::TriggerNotMet {
                task_id: task.id,
                eligible_at: task.eligible_at(),
                now,
            });
        }

        let stored = &task.payload.remaining_accounts;
        if supplied.len() != stored.len()
            || supplied.iter().zip(stored).any(|(a, b)| a.pubkey != b.pubkey)
        {
            return Err(EscrowError::invalid_account(format!(
                "task {} expects {} remaining accounts in stored order",
                task.id,
                stored.len()
            )));
        }

        // Free the slot before running so the payload and its follow-ons see it
        queue.task_bitmap.clear(task.id);
        ctx.store(&task_queue, &queue)?;

        let instructions = task.payload.transaction.decompile(stored)?;
        let seed_vecs: Vec<Vec<&[u8]>> = task
            .payload
            .transaction
            .signer_seeds
            .iter()
            .map(|seeds| seeds.iter().map(Vec::as_slice).collect())
            .collect();
        let signer_seeds: Vec<&[&[u8]]> = seed_vecs.iter().map(Vec::as_slice).collect();

        let mut follow_ons = Vec::new();
        for ix in &instructions {
            debug!("Task {} invoking {}", task.id, ix.program_id);
            if let Some(data) = ctx.invoke_signed(ix, &signer_seeds)? {
                if let Ok(returned) = RunTaskReturn::from_account_data(&data) {
                    follow_ons.extend(returned.tasks);
                }
            }
        }
        if follow_ons.len() > task.free_tasks as usize {
            return Err(EscrowError::invalid_instruction(format!(
                "task {} returned {} follow-on tasks but may queue {}",
                task.id,
                follow_ons.len(),
                task.free_tasks
            )));
        }

        ctx.transfer_lamports(&task_key, &crank_turner, task.crank_reward)?;
        ctx.close_account(&task_key, &rent_refund)?;

        // The payload may itself have touched the queue
        let mut queue: TaskQueue = ctx.load_owned(&task_queue)?;
        let mut follow_on_ids = Vec::with_capacity(follow_ons.len());
        for next in follow_ons {
            let id = queue.task_bitmap.first_free().ok_or(EscrowError::QueueFull {
                queue: task_queue,
                capacity: queue.capacity,
            })?;
            Self::place_task(
                ctx,
                &task_queue,
                &mut queue,
                TaskFunding::QueueDeposit {
                    rent_refund: task_queue,
                },
                None,
                NewTask {
                    id,
                    trigger: next.trigger,
                    payload: next.payload,
                    crank_reward: next.crank_reward,
                    free_tasks: next.free_tasks,
                    description: next.description,
                },
            )?;
            follow_on_ids.push(id);
        }
        ctx.store(&task_queue, &queue)?;

        info!(
            "Ran task {} in slot {} of {}; paid {} to {}",
            task_key, task.id, task_queue, task.crank_reward, crank_turner
        );
        ctx.emit(
            "task_ran",
            &TaskRanEvent {
                task_queue,
                task: task_key,
                id: task.id,
                crank_turner,
                crank_reward: task.crank_reward,
                follow_on_ids,
            },
        )
    }

    fn reclaim_stale_task(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        args: TaskIdArgs,
    ) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let rent_refund = cursor.next_writable()?.pubkey;
        let task_queue = cursor.next_writable()?.pubkey;
        let task_key = cursor.next_writable()?.pubkey;

        let mut queue: TaskQueue = ctx.load_owned(&task_queue)?;
        let task = Self::load_live_task(ctx, &task_queue, &queue, &task_key, args.id)?;
        if task.rent_refund != rent_refund {
            return Err(EscrowError::invalid_account(format!(
                "rent refund must be {}, got {}",
                task.rent_refund, rent_refund
            )));
        }

        let age = task.age(ctx.unix_timestamp());
        if age < i64::from(queue.stale_task_age) {
            return Err(EscrowError::StaleThresholdNotReached {
                task_id: task.id,
                age,
                stale_after: queue.stale_task_age,
            });
        }

        queue.task_bitmap.clear(task.id);
        queue.updated_at = ctx.unix_timestamp();
        ctx.store(&task_queue, &queue)?;
        let lamports = ctx.close_account(&task_key, &rent_refund)?;

        warn!(
            "Reclaimed stale task {} in slot {} of {} after {}s",
            task_key, task.id, task_queue, age
        );
        ctx.emit(
            "task_reclaimed",
            &TaskReclaimedEvent {
                task_queue,
                task: task_key,
                id: task.id,
                age,
                rent_refund,
                lamports,
            },
        )
    }
}

impl Default for TaskQueueProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl Program for TaskQueueProgram {
    fn program_id(&self) -> Pubkey {
        TASK_QUEUE_PROGRAM_ID
    }

    fn process(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        data: &[u8],
    ) -> EscrowResult<()> {
        let (discriminator, args) = split_discriminator(data)?;
        let is = |name: &str| discriminator == instruction_discriminator(name);

        if is(QUEUE_TASK) {
            self.queue_task(ctx, accounts, decode_args(args)?)
        } else if is(RUN_TASK) {
            self.run_task(ctx, accounts, decode_args(args)?)
        } else if is(RECLAIM_STALE_TASK) {
            self.reclaim_stale_task(ctx, accounts, decode_args(args)?)
        } else if is(INITIALIZE_TASK_QUEUE) {
            self.initialize_task_queue(ctx, accounts, decode_args(args)?)
        } else if is(UPDATE_TASK_QUEUE) {
            self.update_task_queue(ctx, accounts, decode_args(args)?)
        } else if is(ADD_QUEUE_AUTHORITY) {
            self.add_queue_authority(ctx, accounts)
        } else if is(REMOVE_QUEUE_AUTHORITY) {
            self.remove_queue_authority(ctx, accounts)
        } else if is(INITIALIZE_QUEUE_CONFIG) {
            self.initialize_queue_config(ctx, accounts, decode_args(args)?)
        } else if is(UPDATE_QUEUE_CONFIG) {
            self.update_queue_config(ctx, accounts, decode_args(args)?)
        } else {
            Err(EscrowError::invalid_instruction(format!(
                "unknown task queue instruction {:?}",
                discriminator
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{TaskQueueClient, TaskQueueParams},
        instruction::{self, QueueTaskArgs, UpdateTaskQueueArgs},
        state::TaskReturn,
    };
    use escrow_core::{compile_transaction, Instruction, Ledger, ProgramRegistry};
    use std::sync::Arc;

    const MEMO_PROGRAM_ID: Pubkey = Pubkey::new_from_array([7; 32]);
    const START: i64 = 1_700_000_000;
    const MIN_REWARD: u64 = 5_000;

    const MEMO_OK: u8 = 0;
    const MEMO_FAIL: u8 = 1;
    const MEMO_CHAIN: u8 = 2;

    /// Payload target: logs, fails, or chains a follow-on task
    struct MemoProgram;

    impl Program for MemoProgram {
        fn program_id(&self) -> Pubkey {
            MEMO_PROGRAM_ID
        }

        fn process(
            &self,
            ctx: &mut InvokeContext<'_>,
            _accounts: &[AccountMeta],
            data: &[u8],
        ) -> EscrowResult<()> {
            match data.first() {
                Some(&MEMO_FAIL) => Err(EscrowError::internal("memo rejected")),
                Some(&MEMO_CHAIN) => {
                    let next = RunTaskReturn {
                        tasks: vec![TaskReturn {
                            trigger: Trigger::Now,
                            payload: memo_payload(MEMO_OK),
                            crank_reward: None,
                            free_tasks: 0,
                            description: "follow-on".to_string(),
                        }],
                    };
                    ctx.set_return_data(next.to_account_data()?)
                }
                _ => ctx.emit("memo", &data.to_vec()),
            }
        }
    }

    fn memo_payload(kind: u8) -> TaskPayload {
        let ix = Instruction {
            program_id: MEMO_PROGRAM_ID,
            accounts: vec![],
            data: vec![kind],
        };
        let (compiled, remaining) = compile_transaction(&[ix], &[], vec![]).unwrap();
        TaskPayload::new(compiled, remaining)
    }

    fn task_args(id: u16, trigger: Trigger, kind: u8) -> QueueTaskArgs {
        QueueTaskArgs {
            id,
            trigger,
            payload: memo_payload(kind),
            crank_reward: None,
            free_tasks: 0,
            description: "memo".to_string(),
        }
    }

    struct Fixture {
        client: TaskQueueClient,
        ledger: Ledger,
        admin: Pubkey,
        authority: Pubkey,
        queue: Pubkey,
    }

    async fn setup(capacity: u16) -> Fixture {
        let registry = ProgramRegistry::new()
            .with_program(Arc::new(TaskQueueProgram::new()))
            .with_program(Arc::new(MemoProgram));
        let ledger = Ledger::with_unix_timestamp(registry, START);
        let client = TaskQueueClient::new(ledger.clone());

        let admin = Pubkey::new_unique();
        let authority = Pubkey::new_unique();
        ledger.airdrop(&admin, 100_000_000_000).await.unwrap();
        ledger.airdrop(&authority, 10_000_000_000).await.unwrap();

        client.initialize_config(&admin, &admin, 100_000_000).await.unwrap();
        let params = TaskQueueParams {
            name: "test-queue".to_string(),
            capacity,
            min_crank_reward: MIN_REWARD,
            stale_task_age: 600,
            max_transaction_size: 1_024,
        };
        let queue = client.create_queue(&admin, &admin, &params).await.unwrap();
        client
            .add_queue_authority(&admin, &admin, &queue, &authority)
            .await
            .unwrap();

        Fixture {
            client,
            ledger,
            admin,
            authority,
            queue,
        }
    }

    #[tokio::test]
    async fn test_enqueue_occupies_slot_and_funds_task() {
        let f = setup(4).await;

        let task = f
            .client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(2, Trigger::Now, MEMO_OK))
            .await
            .unwrap();

        let snapshot = f.client.fetch_queue(&f.queue).await.unwrap();
        assert_eq!(snapshot.live, 1);
        assert!(snapshot.bitmap.is_set(2));
        assert_eq!(snapshot.next_available_id, Some(0));

        let stored = f.client.fetch_task(&task).await.unwrap().unwrap();
        assert_eq!(stored.id, 2);
        assert_eq!(stored.crank_reward, MIN_REWARD);
        assert_eq!(stored.rent_refund, f.authority);
        assert_eq!(
            f.ledger.lamports(&task).await,
            stored.rent_amount + MIN_REWARD
        );
    }

    #[tokio::test]
    async fn test_crank_waits_for_trigger_then_pays_reward() {
        let f = setup(4).await;
        let cranker = Pubkey::new_unique();
        let before = f.ledger.lamports(&f.authority).await;

        f.client
            .enqueue(
                &f.queue,
                &f.authority,
                &f.authority,
                &task_args(0, Trigger::Timestamp(START + 100), MEMO_OK),
            )
            .await
            .unwrap();

        match f.client.crank(&f.queue, 0, &cranker).await.unwrap_err() {
            EscrowError::TriggerNotMet {
                task_id,
                eligible_at,
                now,
            } => {
                assert_eq!(task_id, 0);
                assert_eq!(eligible_at, START + 100);
                assert_eq!(now, START);
            }
            other => panic!("Expected TriggerNotMet, got {:?}", other),
        }

        f.ledger.set_unix_timestamp(START + 100).await;
        let receipt = f.client.crank(&f.queue, 0, &cranker).await.unwrap();

        assert!(receipt.events.iter().any(|e| e.name == "memo"));
        assert!(receipt.events.iter().any(|e| e.name == "task_ran"));
        assert_eq!(f.ledger.lamports(&cranker).await, MIN_REWARD);
        assert_eq!(f.ledger.lamports(&f.authority).await, before - MIN_REWARD);
        let snapshot = f.client.fetch_queue(&f.queue).await.unwrap();
        assert_eq!(snapshot.live, 0);
    }

    #[tokio::test]
    async fn test_task_runs_at_most_once() {
        let f = setup(4).await;
        let cranker = Pubkey::new_unique();
        f.client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(1, Trigger::Now, MEMO_OK))
            .await
            .unwrap();
        let ix = instruction::run_task(cranker, f.authority, f.queue, 1, &[]).unwrap();

        f.ledger.process_transaction(&[ix.clone()], &[cranker]).await.unwrap();
        let second = f.ledger.process_transaction(&[ix], &[cranker]).await;

        assert_eq!(
            second.unwrap_err(),
            EscrowError::TaskNotFound {
                queue: f.queue,
                task_id: 1
            }
        );
        assert_eq!(f.ledger.lamports(&cranker).await, MIN_REWARD);
    }

    #[tokio::test]
    async fn test_failed_payload_keeps_slot_until_stale() {
        let f = setup(4).await;
        let cranker = Pubkey::new_unique();
        let before = f.ledger.lamports(&f.authority).await;
        f.client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(0, Trigger::Now, MEMO_FAIL))
            .await
            .unwrap();

        let result = f.client.crank(&f.queue, 0, &cranker).await;
        assert_eq!(result.unwrap_err(), EscrowError::internal("memo rejected"));
        assert!(f.client.fetch_queue(&f.queue).await.unwrap().bitmap.is_set(0));

        match f.client.reclaim(&f.queue, 0).await.unwrap_err() {
            EscrowError::StaleThresholdNotReached {
                age, stale_after, ..
            } => {
                assert_eq!(age, 0);
                assert_eq!(stale_after, 600);
            }
            other => panic!("Expected StaleThresholdNotReached, got {:?}", other),
        }

        f.ledger.warp(600).await;
        f.client.reclaim(&f.queue, 0).await.unwrap();

        assert!(!f.client.fetch_queue(&f.queue).await.unwrap().bitmap.is_set(0));
        assert!(f.client.fetch_task_by_id(&f.queue, 0).await.unwrap().is_none());
        // rent and the unpaid reward both return
        assert_eq!(f.ledger.lamports(&f.authority).await, before);
    }

    #[tokio::test]
    async fn test_past_trigger_ages_from_queue_time() {
        let f = setup(4).await;
        f.client
            .enqueue(
                &f.queue,
                &f.authority,
                &f.authority,
                &task_args(0, Trigger::Timestamp(START - 10_000), MEMO_FAIL),
            )
            .await
            .unwrap();

        let task = f.client.fetch_task_by_id(&f.queue, 0).await.unwrap().unwrap();
        assert_eq!(task.eligible_at(), START);
        assert!(matches!(
            f.client.reclaim(&f.queue, 0).await.unwrap_err(),
            EscrowError::StaleThresholdNotReached { age: 0, .. }
        ));

        f.ledger.warp(599).await;
        assert!(f.client.reclaim(&f.queue, 0).await.is_err());
        f.ledger.warp(1).await;
        f.client.reclaim(&f.queue, 0).await.unwrap();
        assert!(!f.client.fetch_queue(&f.queue).await.unwrap().bitmap.is_set(0));
    }

    #[tokio::test]
    async fn test_extreme_trigger_reclaim_reports_threshold() {
        let f = setup(4).await;
        for (id, trigger) in [(0, Trigger::Timestamp(i64::MIN)), (1, Trigger::Timestamp(i64::MAX))] {
            f.client
                .enqueue(&f.queue, &f.authority, &f.authority, &task_args(id, trigger, MEMO_FAIL))
                .await
                .unwrap();
        }

        assert!(matches!(
            f.client.reclaim(&f.queue, 0).await.unwrap_err(),
            EscrowError::StaleThresholdNotReached { age: 0, .. }
        ));
        assert!(matches!(
            f.client.reclaim(&f.queue, 1).await.unwrap_err(),
            EscrowError::StaleThresholdNotReached { age, .. } if age < 0
        ));
        let snapshot = f.client.fetch_queue(&f.queue).await.unwrap();
        assert!(snapshot.bitmap.is_set(0));
        assert!(snapshot.bitmap.is_set(1));
    }

    #[tokio::test]
    async fn test_occupied_slot_is_rejected() {
        let f = setup(4).await;
        let args = task_args(3, Trigger::Now, MEMO_OK);
        f.client
            .enqueue(&f.queue, &f.authority, &f.authority, &args)
            .await
            .unwrap();

        let result = f.client.enqueue(&f.queue, &f.authority, &f.authority, &args).await;

        assert_eq!(
            result.unwrap_err(),
            EscrowError::SlotOccupied {
                queue: f.queue,
                task_id: 3
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_allocation_of_same_slot() {
        let f = setup(4).await;
        let args = task_args(0, Trigger::Now, MEMO_OK);

        let (first, second) = tokio::join!(
            f.client.enqueue(&f.queue, &f.authority, &f.authority, &args),
            f.client.enqueue(&f.queue, &f.admin, &f.authority, &args),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(EscrowError::SlotOccupied { task_id: 0, .. })
        )));
        assert_eq!(f.client.fetch_queue(&f.queue).await.unwrap().live, 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_any_id() {
        let f = setup(3).await;
        for id in 0..3 {
            f.client
                .enqueue(&f.queue, &f.authority, &f.authority, &task_args(id, Trigger::Now, MEMO_OK))
                .await
                .unwrap();
        }

        for id in [0, 2, 3, 200] {
            let result = f
                .client
                .enqueue(&f.queue, &f.authority, &f.authority, &task_args(id, Trigger::Now, MEMO_OK))
                .await;
            assert_eq!(
                result.unwrap_err(),
                EscrowError::QueueFull {
                    queue: f.queue,
                    capacity: 3
                }
            );
        }
    }

    #[tokio::test]
    async fn test_id_outside_capacity_is_rejected() {
        let f = setup(3).await;

        let result = f
            .client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(3, Trigger::Now, MEMO_OK))
            .await;

        assert_eq!(
            result.unwrap_err(),
            EscrowError::InvalidTaskId {
                task_id: 3,
                capacity: 3
            }
        );
    }

    #[tokio::test]
    async fn test_unregistered_authority_is_unauthorized() {
        let f = setup(4).await;
        let stranger = Pubkey::new_unique();
        f.ledger.airdrop(&stranger, 1_000_000_000).await.unwrap();

        let result = f
            .client
            .enqueue(&f.queue, &stranger, &stranger, &task_args(0, Trigger::Now, MEMO_OK))
            .await;
        assert!(matches!(result, Err(EscrowError::Unauthorized { caller, .. }) if caller == stranger));

        f.client
            .remove_queue_authority(&f.admin, &f.admin, &f.queue, &f.authority)
            .await
            .unwrap();
        let result = f
            .client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(0, Trigger::Now, MEMO_OK))
            .await;
        assert!(matches!(result, Err(EscrowError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_payload_and_description_limits() {
        let f = setup(4).await;
        f.client
            .update_queue(
                &f.admin,
                &f.queue,
                &UpdateTaskQueueArgs {
                    max_transaction_size: Some(16),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = f
            .client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(0, Trigger::Now, MEMO_OK))
            .await;
        assert!(matches!(
            result,
            Err(EscrowError::PayloadTooLarge { limit: 16, .. })
        ));

        f.client
            .update_queue(
                &f.admin,
                &f.queue,
                &UpdateTaskQueueArgs {
                    max_transaction_size: Some(1_024),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut args = task_args(0, Trigger::Now, MEMO_OK);
        args.description = "x".repeat(41);
        let result = f.client.enqueue(&f.queue, &f.authority, &f.authority, &args).await;
        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_reward_below_minimum_is_rejected() {
        let f = setup(4).await;
        let mut args = task_args(0, Trigger::Now, MEMO_OK);
        args.crank_reward = Some(MIN_REWARD - 1);

        let result = f.client.enqueue(&f.queue, &f.authority, &f.authority, &args).await;

        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_follow_on_task_is_funded_from_queue() {
        let f = setup(4).await;
        let cranker = Pubkey::new_unique();
        let queue_lamports = f.ledger.lamports(&f.queue).await;
        let mut args = task_args(2, Trigger::Now, MEMO_CHAIN);
        args.free_tasks = 1;
        f.client
            .enqueue(&f.queue, &f.authority, &f.authority, &args)
            .await
            .unwrap();

        f.client.crank(&f.queue, 2, &cranker).await.unwrap();

        let snapshot = f.client.fetch_queue(&f.queue).await.unwrap();
        assert_eq!(snapshot.live, 1);
        assert!(snapshot.bitmap.is_set(0));
        let follow_on = f.client.fetch_task_by_id(&f.queue, 0).await.unwrap().unwrap();
        assert_eq!(follow_on.rent_refund, f.queue);
        assert_eq!(follow_on.description, "follow-on");

        f.client.crank(&f.queue, 0, &cranker).await.unwrap();
        assert_eq!(f.client.fetch_queue(&f.queue).await.unwrap().live, 0);
        // the queue only paid the follow-on reward
        assert_eq!(f.ledger.lamports(&f.queue).await, queue_lamports - MIN_REWARD);
        assert_eq!(f.ledger.lamports(&cranker).await, 2 * MIN_REWARD);
    }

    #[tokio::test]
    async fn test_follow_ons_beyond_budget_fail_the_crank() {
        let f = setup(4).await;
        f.client
            .enqueue(&f.queue, &f.authority, &f.authority, &task_args(1, Trigger::Now, MEMO_CHAIN))
            .await
            .unwrap();

        let result = f.client.crank(&f.queue, 1, &Pubkey::new_unique()).await;

        assert!(matches!(result, Err(EscrowError::InvalidInstruction(_))));
        assert!(f.client.fetch_queue(&f.queue).await.unwrap().bitmap.is_set(1));
    }

    #[tokio::test]
    async fn test_queue_parameters_are_validated() {
        let f = setup(4).await;

        for capacity in [0, 257] {
            let params = TaskQueueParams {
                name: format!("cap-{}", capacity),
                capacity,
                ..Default::default()
            };
            let result = f.client.create_queue(&f.admin, &f.admin, &params).await;
            assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
        }

        let duplicate = TaskQueueParams {
            name: "test-queue".to_string(),
            ..Default::default()
        };
        let result = f.client.create_queue(&f.admin, &f.admin, &duplicate).await;
        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_only_update_authority_can_reconfigure() {
        let f = setup(4).await;

        let result = f
            .client
            .update_queue(&f.authority, &f.queue, &UpdateTaskQueueArgs::default())
            .await;
        assert!(matches!(result, Err(EscrowError::Unauthorized { .. })));

        let ix = instruction::update_queue_config(
            f.authority,
            &instruction::UpdateQueueConfigArgs {
                min_deposit: Some(0),
                authority: None,
            },
        )
        .unwrap();
        let result = f.ledger.process_transaction(&[ix], &[f.authority]).await;
        assert!(matches!(result, Err(EscrowError::Unauthorized { .. })));
    }
}
