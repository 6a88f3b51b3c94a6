//! Program runtime
//!
//! Programs are registered by id and invoked with an [`InvokeContext`] that
//! exposes the ledger state, the clock, signer privileges and cross-program
//! invocation. Signer privilege for a derived address is granted by passing
//! its seeds to [`InvokeContext::invoke_signed`] or the token helpers.

use crate::{
    account::AccountState,
    instruction::{AccountMeta, Instruction},
    ledger::LedgerState,
    token::{Mint, TokenAccount},
    EscrowError, EscrowResult,
};
use serde::Serialize;
use solana_pubkey::Pubkey;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, trace};

/// Deepest allowed chain of nested invocations, counting the top level
pub const MAX_INVOKE_DEPTH: usize = 4;

/// Largest return data a program may set
pub const MAX_RETURN_DATA: usize = 1024;

pub trait Program: Send + Sync {
    fn program_id(&self) -> Pubkey;

    fn process(
        &self,
        ctx: &mut InvokeContext<'_>,
        accounts: &[AccountMeta],
        data: &[u8],
    ) -> EscrowResult<()>;
}

/// Programs known to a ledger
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    programs: HashMap<Pubkey, Arc<dyn Program>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, program: Arc<dyn Program>) {
        debug!("Registering program {}", program.program_id());
        self.programs.insert(program.program_id(), program);
    }

    pub fn with_program(mut self, program: Arc<dyn Program>) -> Self {
        self.register(program);
        self
    }

    pub fn get(&self, program_id: &Pubkey) -> EscrowResult<Arc<dyn Program>> {
        self.programs
            .get(program_id)
            .cloned()
            .ok_or(EscrowError::UnknownProgram {
                program_id: *program_id,
            })
    }

    /// Run a top-level instruction against `state`
    pub(crate) fn execute(
        &self,
        state: &mut LedgerState,
        ix: &Instruction,
        signers: &HashSet<Pubkey>,
    ) -> EscrowResult<()> {
        let mut granted = HashSet::new();
        for meta in ix.accounts.iter().filter(|m| m.is_signer) {
            if !signers.contains(&meta.pubkey) {
                return Err(EscrowError::MissingSignature {
                    account: meta.pubkey,
                });
            }
            granted.insert(meta.pubkey);
        }

        let program = self.get(&ix.program_id)?;
        let mut ctx = InvokeContext {
            state,
            registry: self,
            program_id: ix.program_id,
            signers: granted,
            depth: 1,
            return_data: None,
        };
        program.process(&mut ctx, &ix.accounts, &ix.data)
    }
}

/// Execution context of one program invocation
pub struct InvokeContext<'a> {
    state: &'a mut LedgerState,
    registry: &'a ProgramRegistry,
    program_id: Pubkey,
    signers: HashSet<Pubkey>,
    depth: usize,
    return_data: Option<Vec<u8>>,
}

impl<'a> InvokeContext<'a> {
    pub fn program_id(&self) -> Pubkey {
        self.program_id
    }

    pub fn unix_timestamp(&self) -> i64 {
        self.state.unix_timestamp()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_signer(&self, account: &Pubkey) -> bool {
        self.signers.contains(account)
    }

    pub fn require_signer(&self, account: &Pubkey) -> EscrowResult<()> {
        if self.is_signer(account) {
            Ok(())
        } else {
            Err(EscrowError::MissingSignature { account: *account })
        }
    }

    pub fn account_exists(&self, address: &Pubkey) -> bool {
        self.state.account(address).is_some()
    }

    pub fn lamports(&self, address: &Pubkey) -> u64 {
        self.state.lamports(address)
    }

    pub fn owner(&self, address: &Pubkey) -> Option<Pubkey> {
        self.state.account(address).map(|a| a.owner)
    }

    /// Lamports above the rent-exempt minimum of the account's current size
    pub fn spendable_lamports(&self, address: &Pubkey) -> u64 {
        self.state.account(address).map_or(0, |a| {
            a.lamports
                .saturating_sub(crate::account::rent_exempt_minimum(a.data.len()))
        })
    }

    /// Decode any account as `T`
    pub fn load<T: AccountState>(&self, address: &Pubkey) -> EscrowResult<T> {
        self.state.read_state(address)
    }

    /// Decode an account that must belong to the executing program
    pub fn load_owned<T: AccountState>(&self, address: &Pubkey) -> EscrowResult<T> {
        self.require_owned(address)?;
        self.load(address)
    }

    fn require_owned(&self, address: &Pubkey) -> EscrowResult<()> {
        match self.owner(address) {
            Some(owner) if owner == self.program_id => Ok(()),
            Some(owner) => Err(EscrowError::invalid_account(format!(
                "{} is owned by {}, not {}",
                address, owner, self.program_id
            ))),
            None => Err(EscrowError::AccountNotFound { address: *address }),
        }
    }

    /// Whether the program may spend lamports out of `account`
    fn can_debit(&self, account: &Pubkey) -> bool {
        match self.owner(account) {
            Some(owner) if owner == self.program_id => true,
            Some(owner) => owner == crate::address::SYSTEM_PROGRAM_ID && self.is_signer(account),
            None => false,
        }
    }

    fn require_debit(&self, account: &Pubkey) -> EscrowResult<()> {
        if self.can_debit(account) {
            Ok(())
        } else {
            Err(EscrowError::unauthorized(
                *account,
                "cannot spend lamports of this account",
            ))
        }
    }

    /// Allocate a program-owned account holding `state`, rent paid by `payer`
    pub fn create_account<T: AccountState>(
        &mut self,
        payer: &Pubkey,
        address: &Pubkey,
        state: &T,
    ) -> EscrowResult<()> {
        self.require_debit(payer)?;
        let data = state.to_account_data()?;
        self.state
            .create_account(payer, address, self.program_id, data)
    }

    pub fn store<T: AccountState>(&mut self, address: &Pubkey, state: &T) -> EscrowResult<()> {
        self.require_owned(address)?;
        let data = state.to_account_data()?;
        self.state.set_data(address, data)
    }

    /// Close a program-owned account, sending its lamports to `destination`
    pub fn close_account(&mut self, address: &Pubkey, destination: &Pubkey) -> EscrowResult<u64> {
        self.require_owned(address)?;
        self.state.close_account(address, destination)
    }

    pub fn transfer_lamports(&mut self, from: &Pubkey, to: &Pubkey, amount: u64) -> EscrowResult<()> {
        self.require_debit(from)?;
        self.state.transfer(from, to, amount)
    }

    /// Append a structured event to the ledger journal
    pub fn emit<E: Serialize>(&mut self, name: &str, event: &E) -> EscrowResult<()> {
        let data = serde_json::to_value(event)?;
        trace!("Program {} emitted {}", self.program_id, name);
        self.state.push_event(self.program_id, name, data);
        Ok(())
    }

    pub fn set_return_data(&mut self, data: Vec<u8>) -> EscrowResult<()> {
        if data.len() > MAX_RETURN_DATA {
            return Err(EscrowError::PayloadTooLarge {
                size: data.len(),
                limit: MAX_RETURN_DATA,
            });
        }
        self.return_data = Some(data);
        Ok(())
    }

    pub fn take_return_data(&mut self) -> Option<Vec<u8>> {
        self.return_data.take()
    }

    fn signs_for(&self, account: &Pubkey, signer_seeds: &[&[&[u8]]]) -> bool {
        self.is_signer(account)
            || signer_seeds.iter().any(|seeds| {
                Pubkey::create_program_address(seeds, &self.program_id)
                    .map_or(false, |derived| derived == *account)
            })
    }

    /// Invoke another program with this context's signer privileges
    pub fn invoke(&mut self, ix: &Instruction) -> EscrowResult<Option<Vec<u8>>> {
        self.invoke_signed(ix, &[])
    }

    /// Invoke another program, additionally signing for the addresses the
    /// executing program derives from `signer_seeds`.
    ///
    /// Returns the return data the callee set, if any.
    pub fn invoke_signed(
        &mut self,
        ix: &Instruction,
        signer_seeds: &[&[&[u8]]],
    ) -> EscrowResult<Option<Vec<u8>>> {
        if self.depth >= MAX_INVOKE_DEPTH {
            return Err(EscrowError::invalid_instruction(format!(
                "invocation depth limit of {} reached",
                MAX_INVOKE_DEPTH
            )));
        }

        let mut granted = HashSet::new();
        for meta in ix.accounts.iter().filter(|m| m.is_signer) {
            if !self.signs_for(&meta.pubkey, signer_seeds) {
                return Err(EscrowError::MissingSignature {
                    account: meta.pubkey,
                });
            }
            granted.insert(meta.pubkey);
        }

        let program = self.registry.get(&ix.program_id)?;
        debug!(
            "Invoking {} from {} at depth {}",
            ix.program_id,
            self.program_id,
            self.depth + 1
        );
        let mut callee = InvokeContext {
            state: &mut *self.state,
            registry: self.registry,
            program_id: ix.program_id,
            signers: granted,
            depth: self.depth + 1,
            return_data: None,
        };
        program.process(&mut callee, &ix.accounts, &ix.data)?;
        Ok(callee.return_data)
    }

    pub fn mint(&self, address: &Pubkey) -> EscrowResult<Mint> {
        self.state.mint(address)
    }

    pub fn token_account(&self, address: &Pubkey) -> EscrowResult<TokenAccount> {
        self.state.token_account(address)
    }

    /// Create the associated token account of `(owner, mint)`
    pub fn create_associated_token_account(
        &mut self,
        payer: &Pubkey,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> EscrowResult<Pubkey> {
        self.require_debit(payer)?;
        self.state.create_token_account(payer, owner, mint)
    }

    /// Like [`Self::create_associated_token_account`] but succeeds when the
    /// account already exists
    pub fn ensure_associated_token_account(
        &mut self,
        payer: &Pubkey,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> EscrowResult<Pubkey> {
        let address = crate::address::associated_token_address(owner, mint);
        match self.state.account(&address) {
            Some(_) => {
                let existing = self.token_account(&address)?;
                if existing.owner != *owner || existing.mint != *mint {
                    return Err(EscrowError::invalid_account(format!(
                        "{} is not the token account of {} for mint {}",
                        address, owner, mint
                    )));
                }
                Ok(address)
            }
            None => self.create_associated_token_account(payer, owner, mint),
        }
    }

    fn require_token_authority(
        &self,
        account: &Pubkey,
        authority: &Pubkey,
        signer_seeds: &[&[&[u8]]],
    ) -> EscrowResult<TokenAccount> {
        let state = self.token_account(account)?;
        if state.owner != *authority {
            return Err(EscrowError::unauthorized(
                *authority,
                format!("not the owner of token account {}", account),
            ));
        }
        if !self.signs_for(authority, signer_seeds) {
            return Err(EscrowError::MissingSignature {
                account: *authority,
            });
        }
        Ok(state)
    }

    /// Move tokens between accounts of `mint`, with decimals checked
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_checked(
        &mut self,
        from: &Pubkey,
        to: &Pubkey,
        authority: &Pubkey,
        mint: &Pubkey,
        amount: u64,
        decimals: u8,
        signer_seeds: &[&[&[u8]]],
    ) -> EscrowResult<()> {
        self.require_token_authority(from, authority, signer_seeds)?;
        self.state.transfer_tokens(from, to, mint, amount, decimals)
    }

    /// Close an empty token account, returning its rent to `destination`
    pub fn close_token_account(
        &mut self,
        account: &Pubkey,
        destination: &Pubkey,
        authority: &Pubkey,
        signer_seeds: &[&[&[u8]]],
    ) -> EscrowResult<u64> {
        self.require_token_authority(account, authority, signer_seeds)?;
        self.state.close_token_account(account, destination)
    }
}

/// Sequential reader over an instruction's accounts
pub struct AccountCursor<'a> {
    accounts: &'a [AccountMeta],
    pos: usize,
}

impl<'a> AccountCursor<'a> {
    pub fn new(accounts: &'a [AccountMeta]) -> Self {
        Self { accounts, pos: 0 }
    }

    pub fn next(&mut self) -> EscrowResult<&'a AccountMeta> {
        let account = self.accounts.get(self.pos).ok_or_else(|| {
            EscrowError::invalid_instruction(format!(
                "expected at least {} accounts, got {}",
                self.pos + 1,
                self.accounts.len()
            ))
        })?;
        self.pos += 1;
        Ok(account)
    }

    pub fn next_signer(&mut self) -> EscrowResult<&'a AccountMeta> {
        let account = self.next()?;
        if !account.is_signer {
            return Err(EscrowError::MissingSignature {
                account: account.pubkey,
            });
        }
        Ok(account)
    }

    pub fn next_writable(&mut self) -> EscrowResult<&'a AccountMeta> {
        let account = self.next()?;
        if !account.is_writable {
            return Err(EscrowError::invalid_account(format!(
                "{} must be writable",
                account.pubkey
            )));
        }
        Ok(account)
    }

    /// Next account, which must be `expected`
    pub fn next_address(&mut self, expected: &Pubkey) -> EscrowResult<&'a AccountMeta> {
        let account = self.next()?;
        if account.pubkey != *expected {
            return Err(EscrowError::invalid_account(format!(
                "expected {}, got {}",
                expected, account.pubkey
            )));
        }
        Ok(account)
    }

    /// Accounts not consumed yet
    pub fn remaining(&self) -> &'a [AccountMeta] {
        &self.accounts[self.pos.min(self.accounts.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    /// Echoes its instruction data back as return data, or recurses into
    /// itself when the data is `b"recurse"`
    struct EchoProgram {
        id: Pubkey,
    }

    impl Program for EchoProgram {
        fn program_id(&self) -> Pubkey {
            self.id
        }

        fn process(
            &self,
            ctx: &mut InvokeContext<'_>,
            accounts: &[AccountMeta],
            data: &[u8],
        ) -> EscrowResult<()> {
            if data == b"recurse" {
                let ix = Instruction {
                    program_id: self.id,
                    accounts: accounts.to_vec(),
                    data: data.to_vec(),
                };
                ctx.invoke(&ix)?;
                return Ok(());
            }
            ctx.set_return_data(data.to_vec())
        }
    }

    /// Calls the echo program, signing for a derived address
    struct CallerProgram {
        id: Pubkey,
        echo: Pubkey,
    }

    impl Program for CallerProgram {
        fn program_id(&self) -> Pubkey {
            self.id
        }

        fn process(
            &self,
            ctx: &mut InvokeContext<'_>,
            _accounts: &[AccountMeta],
            data: &[u8],
        ) -> EscrowResult<()> {
            let (pda, bump) = Pubkey::find_program_address(&[b"vault"], &self.id);
            let ix = Instruction {
                program_id: self.echo,
                accounts: vec![AccountMeta::new(pda, true)],
                data: data.to_vec(),
            };
            let sign = data.first() == Some(&1);
            let bump_seed = [bump];
            let seeds: &[&[u8]] = &[b"vault", &bump_seed];
            let returned = if sign {
                ctx.invoke_signed(&ix, &[seeds])?
            } else {
                ctx.invoke(&ix)?
            };
            ctx.emit("echoed", &returned)
        }
    }

    fn setup() -> (Ledger, Pubkey, Pubkey) {
        let echo = Pubkey::new_unique();
        let caller = Pubkey::new_unique();
        let registry = ProgramRegistry::new()
            .with_program(Arc::new(EchoProgram { id: echo }))
            .with_program(Arc::new(CallerProgram { id: caller, echo }));
        (Ledger::with_unix_timestamp(registry, 0), echo, caller)
    }

    #[tokio::test]
    async fn test_invoke_signed_grants_derived_signer() {
        let (ledger, _, caller) = setup();
        let ix = Instruction {
            program_id: caller,
            accounts: vec![],
            data: vec![1, 9],
        };

        let receipt = ledger.process_transaction(&[ix], &[]).await.unwrap();

        assert_eq!(receipt.events.len(), 1);
        assert_eq!(receipt.events[0].data, serde_json::json!([1, 9]));
    }

    #[tokio::test]
    async fn test_invoke_without_seeds_lacks_signature() {
        let (ledger, _, caller) = setup();
        let ix = Instruction {
            program_id: caller,
            accounts: vec![],
            data: vec![0],
        };

        let result = ledger.process_transaction(&[ix], &[]).await;

        assert!(matches!(result, Err(EscrowError::MissingSignature { .. })));
    }

    #[tokio::test]
    async fn test_invoke_depth_is_bounded() {
        let (ledger, echo, _) = setup();
        let ix = Instruction {
            program_id: echo,
            accounts: vec![],
            data: b"recurse".to_vec(),
        };

        let result = ledger.process_transaction(&[ix], &[]).await;

        assert!(matches!(result, Err(EscrowError::InvalidInstruction(_))));
    }

    #[tokio::test]
    async fn test_unknown_program_is_rejected() {
        let (ledger, _, _) = setup();
        let ix = Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![],
            data: vec![],
        };

        let result = ledger.process_transaction(&[ix], &[]).await;

        assert!(matches!(result, Err(EscrowError::UnknownProgram { .. })));
    }

    #[test]
    fn test_account_cursor_checks() {
        let signer = Pubkey::new_unique();
        let readonly = Pubkey::new_unique();
        let metas = vec![
            AccountMeta::new(signer, true),
            AccountMeta::new_readonly(readonly, false),
        ];

        let mut cursor = AccountCursor::new(&metas);
        assert_eq!(cursor.next_signer().unwrap().pubkey, signer);
        assert!(cursor.next_writable().is_err());
        assert!(cursor.remaining().is_empty());
        assert!(cursor.next().is_err());
    }
}
