//! Escrow program
//!
//! `make` deposits into a vault and schedules the refund on a task queue in
//! one transaction. `take` and `refund` are the two terminal transitions;
//! both close the escrow and its vault, so whichever runs first wins and the
//! other finds no escrow.

use crate::{
    instruction::{self, EscrowAccounts, MakeArgs, MAKE, REFUND, TAKE},
    state::Escrow,
    ESCROW_PROGRAM_ID,
};
use escrow_core::{
    address::{
        associated_token_address, escrow_address, instruction_discriminator,
        queue_authority_address, QUEUE_AUTHORITY_SEED,
    },
    compile_transaction,
    instruction::{decode_args, split_discriminator},
    AccountCursor, AccountMeta, EscrowError, EscrowResult, InvokeContext, Program, Pubkey,
};
use escrow_queue::{instruction::queue_task, QueueTaskArgs, TaskPayload, Trigger};
use serde::Serialize;
use tracing::info;

const REFUND_DESCRIPTION: &str = "Refund escrow at expiry";

#[derive(Debug, Clone, Serialize)]
struct EscrowMadeEvent {
    escrow: Pubkey,
    maker: Pubkey,
    mint_a: Pubkey,
    mint_b: Pubkey,
    deposit: u64,
    receive: u64,
    expiry: i64,
    task_queue: Pubkey,
    task_id: u16,
}

#[derive(Debug, Clone, Serialize)]
struct EscrowTakenEvent {
    escrow: Pubkey,
    maker: Pubkey,
    taker: Pubkey,
    amount_a: u64,
    amount_b: u64,
}

#[derive(Debug, Clone, Serialize)]
struct EscrowRefundedEvent {
    escrow: Pubkey,
    maker: Pubkey,
    amount_a: u64,
    task_id: u16,
}

pub struct EscrowProgram;

impl EscrowProgram {
    pub fn new() -> Self {
        Self
    }

    /// Validate make parameters before touching any account
    fn validate_make_args(args: &MakeArgs) -> EscrowResult<()> {
        if args.deposit == 0 {
            return Err(EscrowError::invalid_argument("deposit must be positive"));
        }
        if args.receive == 0 {
            return Err(EscrowError::invalid_argument(
                "receive amount must be positive",
            ));
        }
        Ok(())
    }

    /// Load a live escrow. A missing account is reported as `EscrowNotFound`
    /// whether it never existed or was already closed.
    fn load_escrow(ctx: &InvokeContext<'_>, address: &Pubkey) -> EscrowResult<Escrow> {
        if !ctx.account_exists(address) {
            return Err(EscrowError::EscrowNotFound { address: *address });
        }
        let escrow: Escrow = ctx.load_owned(address)?;
        let (expected, _) = escrow_address(&ctx.program_id(), &escrow.maker, escrow.seed);
        if expected != *address {
            return Err(EscrowError::invalid_account(format!(
                "{} is not the escrow address of its maker and seed",
                address
            )));
        }
        Ok(escrow)
    }

    fn require_key(label: &str, actual: &Pubkey, expected: &Pubkey) -> EscrowResult<()> {
        if actual != expected {
            return Err(EscrowError::invalid_account(format!(
                "{} must be {}, got {}",
                label, expected, actual
            )));
        }
        Ok(())
    }

    fn make(&self, ctx: &mut InvokeContext<'_>, accounts: &[AccountMeta], args: MakeArgs) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let maker = cursor.next_signer()?.pubkey;
        let mint_a = cursor.next()?.pubkey;
        let mint_b = cursor.next()?.pubkey;
        let maker_ata_a = cursor.next_writable()?.pubkey;
        let escrow_key = cursor.next_writable()?.pubkey;
        let vault = cursor.next_writable()?.pubkey;
        let _associated_token_program = cursor.next()?;
        let _token_program = cursor.next()?;
        let task_queue = cursor.next_writable()?.pubkey;
        let _task_queue_authority = cursor.next()?;
        let task = cursor.next_writable()?.pubkey;
        let queue_authority = cursor.next()?.pubkey;

        Self::validate_make_args(&args)?;

        let (expected_escrow, bump) = escrow_address(&ctx.program_id(), &maker, args.seed);
        Self::require_key("escrow", &escrow_key, &expected_escrow)?;
        if ctx.account_exists(&escrow_key) {
            return Err(EscrowError::DuplicateEscrow {
                address: escrow_key,
            });
        }
        Self::require_key(
            "maker token account",
            &maker_ata_a,
            &associated_token_address(&maker, &mint_a),
        )?;
        Self::require_key("vault", &vault, &associated_token_address(&escrow_key, &mint_a))?;
        let (expected_authority, authority_bump) = queue_authority_address(&ctx.program_id());
        Self::require_key("queue authority", &queue_authority, &expected_authority)?;

        let mint_a_state = ctx.mint(&mint_a)?;
        ctx.mint(&mint_b)?;
        // A maker that never held mint A has nothing to deposit
        if !ctx.account_exists(&maker_ata_a) {
            return Err(EscrowError::InsufficientFunds {
                account: maker_ata_a,
                required: args.deposit,
                available: 0,
            });
        }

        let escrow = Escrow {
            seed: args.seed,
            maker,
            mint_a,
            mint_b,
            receive: args.receive,
            expiry: args.expiry,
            task_id: args.task_id,
            task_queue,
            created_at: ctx.unix_timestamp(),
            bump,
        };
        ctx.create_account(&maker, &escrow_key, &escrow)?;
        ctx.create_associated_token_account(&maker, &escrow_key, &mint_a)?;
        ctx.transfer_checked(
            &maker_ata_a,
            &vault,
            &maker,
            &mint_a,
            args.deposit,
            mint_a_state.decimals,
            &[],
        )?;

        // The payload carries only static account references; if the escrow
        // is gone when it runs, the refund fails and the task goes stale.
        let refund_ix = instruction::refund(&EscrowAccounts {
            maker,
            mint_a,
            mint_b,
            escrow: escrow_key,
            vault,
        });
        let (compiled, remaining) = compile_transaction(&[refund_ix], &[], Vec::new())?;
        let queue_ix = queue_task(
            maker,
            queue_authority,
            task_queue,
            &QueueTaskArgs {
                id: args.task_id,
                trigger: Trigger::Timestamp(args.expiry),
                payload: TaskPayload::new(compiled, remaining),
                crank_reward: None,
                free_tasks: 0,
                description: REFUND_DESCRIPTION.to_string(),
            },
        )?;
        Self::require_key("task", &task, &queue_ix.accounts[4].pubkey)?;

        let bump_seed = [authority_bump];
        let authority_seeds: &[&[u8]] = &[QUEUE_AUTHORITY_SEED, &bump_seed];
        ctx.invoke_signed(&queue_ix, &[authority_seeds])?;

        info!(
            "Escrow {} made by {}: {} of {} for {} of {}, refund task {} at {}",
            escrow_key, maker, args.deposit, mint_a, args.receive, mint_b, args.task_id, args.expiry
        );
        ctx.emit(
            "escrow_made",
            &EscrowMadeEvent {
                escrow: escrow_key,
                maker,
                mint_a,
                mint_b,
                deposit: args.deposit,
                receive: args.receive,
                expiry: args.expiry,
                task_queue,
                task_id: args.task_id,
            },
        )
    }

    fn take(&self, ctx: &mut InvokeContext<'_>, accounts: &[AccountMeta]) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let taker = cursor.next_signer()?.pubkey;
        let maker = cursor.next_writable()?.pubkey;
        let mint_a = cursor.next()?.pubkey;
        let mint_b = cursor.next()?.pubkey;
        let taker_ata_a = cursor.next_writable()?.pubkey;
        let taker_ata_b = cursor.next_writable()?.pubkey;
        let maker_ata_b = cursor.next_writable()?.pubkey;
        let escrow_key = cursor.next_writable()?.pubkey;
        let vault = cursor.next_writable()?.pubkey;

        let escrow = Self::load_escrow(ctx, &escrow_key)?;
        Self::require_key("maker", &maker, &escrow.maker)?;
        Self::require_key("mint a", &mint_a, &escrow.mint_a)?;
        Self::require_key("mint b", &mint_b, &escrow.mint_b)?;
        Self::require_key("vault", &vault, &associated_token_address(&escrow_key, &mint_a))?;
        Self::require_key(
            "taker token account",
            &taker_ata_a,
            &associated_token_address(&taker, &mint_a),
        )?;
        Self::require_key(
            "maker token account",
            &maker_ata_b,
            &associated_token_address(&maker, &mint_b),
        )?;

        let decimals_a = ctx.mint(&mint_a)?.decimals;
        let decimals_b = ctx.mint(&mint_b)?.decimals;
        ctx.ensure_associated_token_account(&taker, &taker, &mint_a)?;
        ctx.ensure_associated_token_account(&taker, &maker, &mint_b)?;

        ctx.transfer_checked(
            &taker_ata_b,
            &maker_ata_b,
            &taker,
            &mint_b,
            escrow.receive,
            decimals_b,
            &[],
        )?;

        let amount_a = ctx.token_account(&vault)?.amount;
        let seeds = escrow.signer_seeds();
        let seed_refs: Vec<&[u8]> = seeds.iter().map(Vec::as_slice).collect();
        ctx.transfer_checked(
            &vault,
            &taker_ata_a,
            &escrow_key,
            &mint_a,
            amount_a,
            decimals_a,
            &[seed_refs.as_slice()],
        )?;
        ctx.close_token_account(&vault, &maker, &escrow_key, &[seed_refs.as_slice()])?;
        ctx.close_account(&escrow_key, &maker)?;

        info!(
            "Escrow {} taken by {}: {} of {} for {} of {}",
            escrow_key, taker, amount_a, mint_a, escrow.receive, mint_b
        );
        ctx.emit(
            "escrow_taken",
            &EscrowTakenEvent {
                escrow: escrow_key,
                maker,
                taker,
                amount_a,
                amount_b: escrow.receive,
            },
        )
    }

    fn refund(&self, ctx: &mut InvokeContext<'_>, accounts: &[AccountMeta]) -> EscrowResult<()> {
        let mut cursor = AccountCursor::new(accounts);
        let maker = cursor.next_writable()?.pubkey;
        let mint_a = cursor.next()?.pubkey;
        let maker_ata_a = cursor.next_writable()?.pubkey;
        let escrow_key = cursor.next_writable()?.pubkey;
        let vault = cursor.next_writable()?.pubkey;

        let escrow = Self::load_escrow(ctx, &escrow_key)?;
        Self::require_key("maker", &maker, &escrow.maker)?;
        Self::require_key("mint a", &mint_a, &escrow.mint_a)?;
        Self::require_key(
            "maker token account",
            &maker_ata_a,
            &associated_token_address(&maker, &mint_a),
        )?;
        Self::require_key("vault", &vault, &associated_token_address(&escrow_key, &mint_a))?;

        let now = ctx.unix_timestamp();
        if now < escrow.expiry {
            return Err(EscrowError::RefundNotYetAllowed {
                now,
                expiry: escrow.expiry,
            });
        }

        let decimals = ctx.mint(&mint_a)?.decimals;
        let amount_a = ctx.token_account(&vault)?.amount;
        let seeds = escrow.signer_seeds();
        let seed_refs: Vec<&[u8]> = seeds.iter().map(Vec::as_slice).collect();
        ctx.transfer_checked(
            &vault,
            &maker_ata_a,
            &escrow_key,
            &mint_a,
            amount_a,
            decimals,
            &[seed_refs.as_slice()],
        )?;
        ctx.close_token_account(&vault, &maker, &escrow_key, &[seed_refs.as_slice()])?;
        ctx.close_account(&escrow_key, &maker)?;

        info!(
            "Escrow {} refunded {} of {} to {}",
            escrow_key, amount_a, mint_a, maker
        );
        ctx.emit(
            "escrow_refunded",
            &EscrowRefundedEvent {
                escrow: escrow_key,
                maker,
                amount_a,
                task_id: escrow.task_id,
            },
        )
    }
}

impl Default for EscrowProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl Program for EscrowProgram {
    fn program_id(&self) -> Pubkey {
        ESCROW_PROGRAM_ID
    }

    fn process(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        data: &[u8],
    ) -> EscrowResult<()> {
        let (discriminator, args) = split_discriminator(data)?;
        if discriminator == instruction_discriminator(MAKE) {
            self.make(ctx, accounts, decode_args(args)?)
        } else if discriminator == instruction_discriminator(TAKE) {
            self.take(ctx, accounts)
        } else if discriminator == instruction_discriminator(REFUND) {
            self.refund(ctx, accounts)
        } else {
            Err(EscrowError::invalid_instruction(format!(
                "unknown escrow instruction {:?}",
                discriminator
            )))
        }
    }
}
