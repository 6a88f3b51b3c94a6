//! Token mints and token accounts
//!
//! The token program is built into the ledger. These are the raw state
//! operations; authority checks live on [`crate::runtime::InvokeContext`].

use crate::{
    account::{Account, AccountState},
    address::{associated_token_address, TOKEN_PROGRAM_ID},
    ledger::LedgerState,
    EscrowError, EscrowResult,
};
use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mint {
    pub mint_authority: Pubkey,
    pub supply: u64,
    pub decimals: u8,
}

impl AccountState for Mint {
    const NAME: &'static str = "Mint";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccount {
    pub mint: Pubkey,
    pub owner: Pubkey,
    pub amount: u64,
}

impl AccountState for TokenAccount {
    const NAME: &'static str = "TokenAccount";
}

impl LedgerState {
    pub fn mint(&self, address: &Pubkey) -> EscrowResult<Mint> {
        self.token_state(address)
    }

    pub fn token_account(&self, address: &Pubkey) -> EscrowResult<TokenAccount> {
        self.token_state(address)
    }

    fn token_state<T: AccountState>(&self, address: &Pubkey) -> EscrowResult<T> {
        let account = self
            .account(address)
            .ok_or(EscrowError::AccountNotFound { address: *address })?;
        if account.owner != TOKEN_PROGRAM_ID {
            return Err(EscrowError::invalid_account(format!(
                "{} is not owned by the token program",
                address
            )));
        }
        T::from_account_data(&account.data)
    }

    fn store_token_state<T: AccountState>(&mut self, address: &Pubkey, state: &T) -> EscrowResult<()> {
        let data = state.to_account_data()?;
        self.set_data(address, data)
    }

    /// Create the associated token account for `(owner, mint)`, rent paid by `payer`
    pub(crate) fn create_token_account(
        &mut self,
        payer: &Pubkey,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> EscrowResult<Pubkey> {
        self.mint(mint)?;
        let address = associated_token_address(owner, mint);
        let data = TokenAccount {
            mint: *mint,
            owner: *owner,
            amount: 0,
        }
        .to_account_data()?;
        self.create_account(payer, &address, TOKEN_PROGRAM_ID, data)?;
        Ok(address)
    }

    pub(crate) fn transfer_tokens(
        &mut self,
        from: &Pubkey,
        to: &Pubkey,
        mint: &Pubkey,
        amount: u64,
        decimals: u8,
    ) -> EscrowResult<()> {
        let mint_state = self.mint(mint)?;
        if mint_state.decimals != decimals {
            return Err(EscrowError::invalid_argument(format!(
                "mint {} has {} decimals, got {}",
                mint, mint_state.decimals, decimals
            )));
        }

        let mut source = self.token_account(from)?;
        let mut destination = self.token_account(to)?;
        if source.mint != *mint || destination.mint != *mint {
            return Err(EscrowError::invalid_account(format!(
                "token accounts {} and {} must both hold mint {}",
                from, to, mint
            )));
        }
        if source.amount < amount {
            return Err(EscrowError::InsufficientFunds {
                account: *from,
                required: amount,
                available: source.amount,
            });
        }
        if from == to {
            return Ok(());
        }

        source.amount -= amount;
        destination.amount = destination
            .amount
            .checked_add(amount)
            .ok_or_else(|| EscrowError::internal("token balance overflow"))?;
        self.store_token_state(from, &source)?;
        self.store_token_state(to, &destination)
    }

    /// Close an empty token account, returning its rent to `destination`
    pub(crate) fn close_token_account(&mut self, account: &Pubkey, destination: &Pubkey) -> EscrowResult<u64> {
        let state = self.token_account(account)?;
        if state.amount != 0 {
            return Err(EscrowError::invalid_argument(format!(
                "token account {} still holds {}",
                account, state.amount
            )));
        }
        self.close_account(account, destination)
    }

    pub(crate) fn create_mint(
        &mut self,
        payer: &Pubkey,
        address: &Pubkey,
        mint_authority: &Pubkey,
        decimals: u8,
    ) -> EscrowResult<()> {
        let data = Mint {
            mint_authority: *mint_authority,
            supply: 0,
            decimals,
        }
        .to_account_data()?;
        self.create_account(payer, address, TOKEN_PROGRAM_ID, data)
    }

    pub(crate) fn mint_tokens(&mut self, mint: &Pubkey, to: &Pubkey, amount: u64) -> EscrowResult<()> {
        let mut mint_state = self.mint(mint)?;
        let mut destination = self.token_account(to)?;
        if destination.mint != *mint {
            return Err(EscrowError::invalid_account(format!(
                "token account {} does not hold mint {}",
                to, mint
            )));
        }
        mint_state.supply = mint_state
            .supply
            .checked_add(amount)
            .ok_or_else(|| EscrowError::internal("mint supply overflow"))?;
        destination.amount += amount;
        self.store_token_state(mint, &mint_state)?;
        self.store_token_state(to, &destination)
    }
}

impl Account {
    /// Decode this account as a token account
    pub fn as_token_account(&self) -> Option<TokenAccount> {
        if self.owner != TOKEN_PROGRAM_ID {
            return None;
        }
        TokenAccount::from_account_data(&self.data).ok()
    }
}
