//! Ledger - the deterministic execution environment
//!
//! Holds every account, the clock and the event journal. Transactions run
//! against a working copy of the state and commit only when every
//! instruction succeeds, so each operation is all-or-nothing. A single
//! write lock serializes transactions; validation performed inside a
//! transaction is therefore checked at commit time.

use crate::{
    account::{rent_exempt_minimum, Account, AccountState},
    address::SYSTEM_PROGRAM_ID,
    instruction::Instruction,
    runtime::ProgramRegistry,
    EscrowError, EscrowResult,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Structured event emitted by a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramEvent {
    pub program_id: Pubkey,
    pub name: String,
    pub data: serde_json::Value,
    pub slot: u64,
    pub unix_timestamp: i64,
}

/// Result of a committed transaction
#[derive(Debug, Clone)]
pub struct TransactionReceipt {
    pub id: Uuid,
    pub slot: u64,
    pub unix_timestamp: i64,
    pub events: Vec<ProgramEvent>,
}

/// Snapshot of every account plus clock and journal
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    unix_timestamp: i64,
    slot: u64,
    accounts: HashMap<Pubkey, Account>,
    events: Vec<ProgramEvent>,
}

impl LedgerState {
    pub fn new(unix_timestamp: i64) -> Self {
        Self {
            unix_timestamp,
            ..Self::default()
        }
    }

    pub fn unix_timestamp(&self) -> i64 {
        self.unix_timestamp
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn account(&self, address: &Pubkey) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn lamports(&self, address: &Pubkey) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.lamports)
    }

    /// Read typed state, failing if the account is missing
    pub fn read_state<T: AccountState>(&self, address: &Pubkey) -> EscrowResult<T> {
        let account = self
            .account(address)
            .ok_or(EscrowError::AccountNotFound { address: *address })?;
        T::from_account_data(&account.data)
    }

    pub(crate) fn debit(&mut self, address: &Pubkey, amount: u64) -> EscrowResult<()> {
        let available = self.lamports(address);
        if available < amount {
            return Err(EscrowError::InsufficientFunds {
                account: *address,
                required: amount,
                available,
            });
        }
        if let Some(account) = self.accounts.get_mut(address) {
            account.lamports -= amount;
        }
        Ok(())
    }

    /// Credit lamports, creating a system account on first receipt
    pub(crate) fn credit(&mut self, address: &Pubkey, amount: u64) -> EscrowResult<()> {
        let account = self.accounts.entry(*address).or_insert_with(|| Account {
            lamports: 0,
            owner: SYSTEM_PROGRAM_ID,
            data: Vec::new(),
        });
        account.lamports = account
            .lamports
            .checked_add(amount)
            .ok_or_else(|| EscrowError::internal("lamport overflow"))?;
        Ok(())
    }

    pub(crate) fn transfer(&mut self, from: &Pubkey, to: &Pubkey, amount: u64) -> EscrowResult<()> {
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    /// Allocate `data` at `address` owned by `owner`, funding rent from `payer`.
    ///
    /// An address holding only lamports can still be allocated; one with data
    /// or a non-system owner cannot.
    pub(crate) fn create_account(
        &mut self,
        payer: &Pubkey,
        address: &Pubkey,
        owner: Pubkey,
        data: Vec<u8>,
    ) -> EscrowResult<()> {
        if let Some(existing) = self.accounts.get(address) {
            if existing.owner != SYSTEM_PROGRAM_ID || !existing.data.is_empty() {
                return Err(EscrowError::AccountAlreadyExists { address: *address });
            }
        }
        let rent = rent_exempt_minimum(data.len());
        self.transfer(payer, address, rent)?;
        if let Some(account) = self.accounts.get_mut(address) {
            account.owner = owner;
            account.data = data;
        }
        Ok(())
    }

    pub(crate) fn set_data(&mut self, address: &Pubkey, data: Vec<u8>) -> EscrowResult<()> {
        let account = self
            .accounts
            .get_mut(address)
            .ok_or(EscrowError::AccountNotFound { address: *address })?;
        account.data = data;
        Ok(())
    }

    /// Remove an account, moving all of its lamports to `destination`
    pub(crate) fn close_account(&mut self, address: &Pubkey, destination: &Pubkey) -> EscrowResult<u64> {
        let account = self
            .accounts
            .remove(address)
            .ok_or(EscrowError::AccountNotFound { address: *address })?;
        self.credit(destination, account.lamports)?;
        Ok(account.lamports)
    }

    pub(crate) fn push_event(&mut self, program_id: Pubkey, name: &str, data: serde_json::Value) {
        let event = ProgramEvent {
            program_id,
            name: name.to_string(),
            data,
            slot: self.slot,
            unix_timestamp: self.unix_timestamp,
        };
        self.events.push(event);
    }
}

/// Run `f` with a temporary payer that covers any rent, then drop the payer
fn with_genesis_payer<F>(state: &mut LedgerState, f: F) -> EscrowResult<()>
where
    F: FnOnce(&mut LedgerState, &Pubkey) -> EscrowResult<()>,
{
    let genesis = Pubkey::new_unique();
    state.credit(&genesis, rent_exempt_minimum(u16::MAX as usize))?;
    let result = f(state, &genesis);
    state.accounts.remove(&genesis);
    result
}

/// Shared handle to the ledger
#[derive(Clone)]
pub struct Ledger {
    state: Arc<RwLock<LedgerState>>,
    registry: Arc<ProgramRegistry>,
}

impl Ledger {
    /// Create a ledger whose clock starts at the current wall-clock time
    pub fn new(registry: ProgramRegistry) -> Self {
        Self::with_unix_timestamp(registry, Utc::now().timestamp())
    }

    pub fn with_unix_timestamp(registry: ProgramRegistry, unix_timestamp: i64) -> Self {
        info!("Initializing ledger at unix time {}", unix_timestamp);
        Self {
            state: Arc::new(RwLock::new(LedgerState::new(unix_timestamp))),
            registry: Arc::new(registry),
        }
    }

    /// Execute `instructions` atomically.
    ///
    /// Every account an instruction marks as signer must be in `signers`.
    /// On any failure no state changes.
    pub async fn process_transaction(
        &self,
        instructions: &[Instruction],
        signers: &[Pubkey],
    ) -> EscrowResult<TransactionReceipt> {
        let signer_set: HashSet<Pubkey> = signers.iter().copied().collect();
        let mut guard = self.state.write().await;
        let mut working = guard.clone();
        let first_event = working.events.len();

        for (index, ix) in instructions.iter().enumerate() {
            if let Err(err) = self.registry.execute(&mut working, ix, &signer_set) {
                warn!(
                    "Transaction rejected at instruction {} (program {}): {}",
                    index, ix.program_id, err
                );
                return Err(err);
            }
        }

        working.slot += 1;
        let receipt = TransactionReceipt {
            id: Uuid::new_v4(),
            slot: working.slot,
            unix_timestamp: working.unix_timestamp,
            events: working.events[first_event..].to_vec(),
        };
        *guard = working;

        debug!("Committed transaction {} at slot {}", receipt.id, receipt.slot);
        Ok(receipt)
    }

    pub async fn unix_timestamp(&self) -> i64 {
        self.state.read().await.unix_timestamp
    }

    pub async fn set_unix_timestamp(&self, unix_timestamp: i64) {
        self.state.write().await.unix_timestamp = unix_timestamp;
    }

    /// Move the clock forward (or backward for negative values)
    pub async fn warp(&self, seconds: i64) -> i64 {
        let mut state = self.state.write().await;
        state.unix_timestamp += seconds;
        state.unix_timestamp
    }

    pub async fn airdrop(&self, to: &Pubkey, lamports: u64) -> EscrowResult<()> {
        self.state.write().await.credit(to, lamports)
    }

    /// Create a mint at a fresh address; rent is airdropped
    pub async fn create_mint(&self, mint_authority: &Pubkey, decimals: u8) -> EscrowResult<Pubkey> {
        let address = Pubkey::new_unique();
        let mut state = self.state.write().await;
        with_genesis_payer(&mut state, |state, payer| {
            state.create_mint(payer, &address, mint_authority, decimals)
        })?;
        debug!("Created mint {} with {} decimals", address, decimals);
        Ok(address)
    }

    /// Mint `amount` into `owner`'s associated token account, creating it if needed
    pub async fn mint_to(&self, mint: &Pubkey, owner: &Pubkey, amount: u64) -> EscrowResult<Pubkey> {
        let mut state = self.state.write().await;
        let ata = crate::address::associated_token_address(owner, mint);
        if state.account(&ata).is_none() {
            with_genesis_payer(&mut state, |state, payer| {
                state.create_token_account(payer, owner, mint).map(|_| ())
            })?;
        }
        state.mint_tokens(mint, &ata, amount)?;
        Ok(ata)
    }

    pub async fn account(&self, address: &Pubkey) -> Option<Account> {
        self.state.read().await.account(address).cloned()
    }

    pub async fn lamports(&self, address: &Pubkey) -> u64 {
        self.state.read().await.lamports(address)
    }

    /// Fetch typed state; `None` when the account does not exist
    pub async fn fetch<T: AccountState>(&self, address: &Pubkey) -> EscrowResult<Option<T>> {
        let state = self.state.read().await;
        match state.account(address) {
            Some(account) => Ok(Some(T::from_account_data(&account.data)?)),
            None => Ok(None),
        }
    }

    pub async fn token_balance(&self, address: &Pubkey) -> EscrowResult<u64> {
        Ok(self.state.read().await.token_account(address)?.amount)
    }

    pub async fn events(&self) -> Vec<ProgramEvent> {
        self.state.read().await.events.clone()
    }

    /// Read a consistent snapshot of the whole state
    pub async fn snapshot(&self) -> LedgerState {
        self.state.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instruction::AccountMeta,
        runtime::{InvokeContext, Program},
    };

    /// Moves lamports from a signer to a destination, then optionally fails
    struct PayProgram {
        id: Pubkey,
    }

    impl Program for PayProgram {
        fn program_id(&self) -> Pubkey {
            self.id
        }

        fn process(
            &self,
            ctx: &mut InvokeContext<'_>,
            accounts: &[AccountMeta],
            data: &[u8],
        ) -> EscrowResult<()> {
            ctx.transfer_lamports(&accounts[0].pubkey, &accounts[1].pubkey, 10)?;
            if data.first() == Some(&1) {
                return Err(EscrowError::internal("requested failure"));
            }
            Ok(())
        }
    }

    fn ledger_with_pay_program() -> (Ledger, Pubkey) {
        let id = Pubkey::new_unique();
        let registry = ProgramRegistry::new().with_program(Arc::new(PayProgram { id }));
        (Ledger::with_unix_timestamp(registry, 1_000), id)
    }

    fn pay(program: Pubkey, from: Pubkey, to: Pubkey, fail: bool) -> Instruction {
        Instruction {
            program_id: program,
            accounts: vec![AccountMeta::new(from, true), AccountMeta::new(to, false)],
            data: vec![fail as u8],
        }
    }

    #[tokio::test]
    async fn test_transaction_commits_on_success() {
        let (ledger, program) = ledger_with_pay_program();
        let payer = Pubkey::new_unique();
        let payee = Pubkey::new_unique();
        ledger.airdrop(&payer, 100).await.unwrap();

        let receipt = ledger
            .process_transaction(&[pay(program, payer, payee, false)], &[payer])
            .await
            .unwrap();

        assert_eq!(receipt.slot, 1);
        assert_eq!(ledger.lamports(&payer).await, 90);
        assert_eq!(ledger.lamports(&payee).await, 10);
    }

    #[tokio::test]
    async fn test_failed_instruction_rolls_back_whole_transaction() {
        let (ledger, program) = ledger_with_pay_program();
        let payer = Pubkey::new_unique();
        let payee = Pubkey::new_unique();
        ledger.airdrop(&payer, 100).await.unwrap();

        let result = ledger
            .process_transaction(
                &[
                    pay(program, payer, payee, false),
                    pay(program, payer, payee, true),
                ],
                &[payer],
            )
            .await;

        assert!(result.is_err());
        assert_eq!(ledger.lamports(&payer).await, 100);
        assert_eq!(ledger.lamports(&payee).await, 0);
    }

    #[tokio::test]
    async fn test_missing_signer_is_rejected() {
        let (ledger, program) = ledger_with_pay_program();
        let payer = Pubkey::new_unique();
        ledger.airdrop(&payer, 100).await.unwrap();

        let result = ledger
            .process_transaction(&[pay(program, payer, Pubkey::new_unique(), false)], &[])
            .await;

        assert_eq!(
            result.unwrap_err(),
            EscrowError::MissingSignature { account: payer }
        );
    }

    #[tokio::test]
    async fn test_mint_to_creates_associated_account() {
        let (ledger, _) = ledger_with_pay_program();
        let authority = Pubkey::new_unique();
        let owner = Pubkey::new_unique();

        let mint = ledger.create_mint(&authority, 6).await.unwrap();
        let ata = ledger.mint_to(&mint, &owner, 500).await.unwrap();
        ledger.mint_to(&mint, &owner, 250).await.unwrap();

        assert_eq!(ata, crate::address::associated_token_address(&owner, &mint));
        assert_eq!(ledger.token_balance(&ata).await.unwrap(), 750);
    }

    #[tokio::test]
    async fn test_clock_warp() {
        let (ledger, _) = ledger_with_pay_program();
        assert_eq!(ledger.warp(500).await, 1_500);
        ledger.set_unix_timestamp(42).await;
        assert_eq!(ledger.unix_timestamp().await, 42);
    }
}
