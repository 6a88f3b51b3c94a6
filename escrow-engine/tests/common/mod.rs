//! Shared fixture: a ledger with both programs, a registered refund queue,
//! two mints, a funded maker and a funded taker.

#![allow(dead_code)]

use escrow_core::{Ledger, Pubkey};
use escrow_engine::{program_registry, EscrowNode, EscrowNodeConfig, MakeEscrowRequest};
use escrow_queue::{TaskQueueClient, TaskQueueParams};

pub const START: i64 = 1_700_000_000;
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;
pub const MIN_DEPOSIT: u64 = LAMPORTS_PER_SOL / 10;
pub const MIN_CRANK_REWARD: u64 = 10_000;
pub const STALE_TASK_AGE: u32 = 3_600;
pub const DECIMALS: u8 = 6;
pub const INITIAL_TOKENS: u64 = 1_000_000_000;

pub struct TestEnv {
    pub ledger: Ledger,
    pub node: EscrowNode,
    pub queue_client: TaskQueueClient,
    pub queue: Pubkey,
    pub admin: Pubkey,
    pub mint_a: Pubkey,
    pub mint_b: Pubkey,
    pub maker: Pubkey,
    pub taker: Pubkey,
}

impl TestEnv {
    pub fn request(&self, seed: u64, deposit: u64, receive: u64, expiry: i64) -> MakeEscrowRequest {
        MakeEscrowRequest {
            maker: self.maker,
            mint_a: self.mint_a,
            mint_b: self.mint_b,
            seed,
            deposit,
            receive,
            expiry,
        }
    }

    /// A second maker holding mint A
    pub async fn funded_maker(&self) -> anyhow::Result<Pubkey> {
        let maker = Pubkey::new_unique();
        self.ledger.airdrop(&maker, 10 * LAMPORTS_PER_SOL).await?;
        self.ledger.mint_to(&self.mint_a, &maker, INITIAL_TOKENS).await?;
        Ok(maker)
    }

    pub async fn balance(&self, owner: &Pubkey, mint: &Pubkey) -> anyhow::Result<u64> {
        let ata = escrow_core::address::associated_token_address(owner, mint);
        Ok(self.ledger.token_balance(&ata).await?)
    }

    pub async fn slot_is_set(&self, task_id: u16) -> anyhow::Result<bool> {
        Ok(self
            .queue_client
            .fetch_queue(&self.queue)
            .await?
            .bitmap
            .is_set(task_id))
    }
}

pub async fn setup(capacity: u16) -> anyhow::Result<TestEnv> {
    let ledger = Ledger::with_unix_timestamp(program_registry(), START);
    let queue_client = TaskQueueClient::new(ledger.clone());

    let admin = Pubkey::new_unique();
    let maker = Pubkey::new_unique();
    let taker = Pubkey::new_unique();
    ledger.airdrop(&admin, 100 * LAMPORTS_PER_SOL).await?;
    ledger.airdrop(&maker, 100 * LAMPORTS_PER_SOL).await?;
    ledger.airdrop(&taker, 10 * LAMPORTS_PER_SOL).await?;

    queue_client
        .initialize_config(&admin, &admin, MIN_DEPOSIT)
        .await?;
    let params = TaskQueueParams {
        capacity,
        min_crank_reward: MIN_CRANK_REWARD,
        stale_task_age: STALE_TASK_AGE,
        ..TaskQueueParams::default()
    };
    let queue = queue_client.create_queue(&admin, &admin, &params).await?;
    queue_client
        .add_queue_authority(&admin, &admin, &queue, &EscrowNode::queue_authority())
        .await?;

    let mint_a = ledger.create_mint(&admin, DECIMALS).await?;
    let mint_b = ledger.create_mint(&admin, DECIMALS).await?;
    ledger.mint_to(&mint_a, &maker, INITIAL_TOKENS).await?;
    ledger.mint_to(&mint_b, &taker, INITIAL_TOKENS).await?;

    let node = EscrowNode::new(ledger.clone(), EscrowNodeConfig::new(queue));

    Ok(TestEnv {
        ledger,
        node,
        queue_client,
        queue,
        admin,
        mint_a,
        mint_b,
        maker,
        taker,
    })
}
