//! Escrow account state

use escrow_core::{address::ESCROW_SEED, AccountState, Pubkey};
use serde::{Deserialize, Serialize};

/// One pending trade. The vault holding the deposit is the associated
/// token account of this escrow's address for `mint_a`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub seed: u64,
    pub maker: Pubkey,
    pub mint_a: Pubkey,
    pub mint_b: Pubkey,
    /// Amount of `mint_b` the maker wants
    pub receive: u64,
    /// Refund is allowed from this unix timestamp on
    pub expiry: i64,
    /// Slot of the scheduled refund task
    pub task_id: u16,
    pub task_queue: Pubkey,
    pub created_at: i64,
    pub bump: u8,
}

impl AccountState for Escrow {
    const NAME: &'static str = "Escrow";
}

impl Escrow {
    /// Seeds the escrow program signs with for this escrow's address
    pub fn signer_seeds(&self) -> [Vec<u8>; 4] {
        [
            ESCROW_SEED.to_vec(),
            self.maker.to_bytes().to_vec(),
            self.seed.to_le_bytes().to_vec(),
            vec![self.bump],
        ]
    }
}
