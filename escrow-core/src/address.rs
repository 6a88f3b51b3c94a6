//! Address derivation
//!
//! Every entity in the system lives at a program-derived address computed
//! from stable seeds, so escrows, vaults and tasks can be located without an
//! index. The derivations here must stay bit-exact with external crankers
//! and indexers.

use sha2::{Digest, Sha256};
use solana_pubkey::Pubkey;

pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::from_str_const("11111111111111111111111111111111");
pub const TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA");
pub const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

pub const ESCROW_SEED: &[u8] = b"escrow";
pub const TASK_SEED: &[u8] = b"task";
pub const QUEUE_AUTHORITY_SEED: &[u8] = b"queue_authority";
pub const TASK_QUEUE_AUTHORITY_SEED: &[u8] = b"task_queue_authority";
pub const QUEUE_CONFIG_SEED: &[u8] = b"queue_config";
pub const TASK_QUEUE_SEED: &[u8] = b"task_queue";
pub const TASK_QUEUE_NAME_MAPPING_SEED: &[u8] = b"task_queue_name_mapping";

/// Escrow address for `(maker, seed)` under the escrow program
pub fn escrow_address(program_id: &Pubkey, maker: &Pubkey, seed: u64) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[ESCROW_SEED, maker.as_ref(), &seed.to_le_bytes()],
        program_id,
    )
}

/// Standard associated token account for `(owner, mint)`.
///
/// The owner may itself be a derived address.
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[owner.as_ref(), TOKEN_PROGRAM_ID.as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

/// Task address for slot `task_id` of `queue`.
///
/// The id is encoded as a single byte, which caps queue capacity at 256.
pub fn task_address(queue_program_id: &Pubkey, queue: &Pubkey, task_id: u16) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[TASK_SEED, queue.as_ref(), &[task_id as u8]],
        queue_program_id,
    )
}

/// Authority a program uses to enqueue tasks on its own behalf
pub fn queue_authority_address(program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[QUEUE_AUTHORITY_SEED], program_id)
}

/// Registration record proving `authority` may enqueue on `queue`
pub fn task_queue_authority_address(
    queue_program_id: &Pubkey,
    queue: &Pubkey,
    authority: &Pubkey,
) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[TASK_QUEUE_AUTHORITY_SEED, queue.as_ref(), authority.as_ref()],
        queue_program_id,
    )
}

pub fn queue_config_address(queue_program_id: &Pubkey) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[QUEUE_CONFIG_SEED], queue_program_id)
}

pub fn task_queue_address(queue_program_id: &Pubkey, config: &Pubkey, id: u32) -> (Pubkey, u8) {
    Pubkey::find_program_address(
        &[TASK_QUEUE_SEED, config.as_ref(), &id.to_le_bytes()],
        queue_program_id,
    )
}

/// Name mapping keeps queue names unique; the name is hashed so any length fits a seed
pub fn task_queue_name_mapping_address(
    queue_program_id: &Pubkey,
    config: &Pubkey,
    name: &str,
) -> (Pubkey, u8) {
    let name_hash = Sha256::digest(name.as_bytes());
    Pubkey::find_program_address(
        &[TASK_QUEUE_NAME_MAPPING_SEED, config.as_ref(), &name_hash],
        queue_program_id,
    )
}

/// First 8 bytes of `sha256("global:" + name)`
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    hashed_discriminator("global", name)
}

/// First 8 bytes of `sha256("account:" + type_name)`
pub fn account_discriminator(type_name: &str) -> [u8; 8] {
    hashed_discriminator("account", type_name)
}

fn hashed_discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let hash = Sha256::digest(format!("{}:{}", namespace, name).as_bytes());
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&hash[..8]);
    discriminator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escrow_address_is_stable_per_seed() {
        let program = Pubkey::new_unique();
        let maker = Pubkey::new_unique();

        let (first, bump) = escrow_address(&program, &maker, 42);
        let (again, bump_again) = escrow_address(&program, &maker, 42);
        let (other, _) = escrow_address(&program, &maker, 43);

        assert_eq!(first, again);
        assert_eq!(bump, bump_again);
        assert_ne!(first, other);
        assert!(!first.is_on_curve());
    }

    #[test]
    fn test_escrow_address_matches_manual_seeds() {
        let program = Pubkey::new_unique();
        let maker = Pubkey::new_unique();
        let seed = 7u64;

        let (address, bump) = escrow_address(&program, &maker, seed);
        let recreated = Pubkey::create_program_address(
            &[b"escrow", maker.as_ref(), &seed.to_le_bytes(), &[bump]],
            &program,
        )
        .unwrap();

        assert_eq!(address, recreated);
    }

    #[test]
    fn test_task_address_uses_single_byte_id() {
        let program = Pubkey::new_unique();
        let queue = Pubkey::new_unique();

        let (zero, _) = task_address(&program, &queue, 0);
        let (one, _) = task_address(&program, &queue, 1);
        assert_ne!(zero, one);

        let (expected, _) =
            Pubkey::find_program_address(&[b"task", queue.as_ref(), &[1u8]], &program);
        assert_eq!(one, expected);
    }

    #[test]
    fn test_instruction_discriminator() {
        // sha256("global:refund")
        let hash = Sha256::digest(b"global:refund");
        assert_eq!(instruction_discriminator("refund"), hash[..8]);
        assert_ne!(
            instruction_discriminator("make"),
            instruction_discriminator("take")
        );
        assert_ne!(
            instruction_discriminator("refund"),
            account_discriminator("refund")
        );
    }

    #[test]
    fn test_associated_token_address_differs_by_mint() {
        let owner = Pubkey::new_unique();
        let mint_a = Pubkey::new_unique();
        let mint_b = Pubkey::new_unique();
        assert_ne!(
            associated_token_address(&owner, &mint_a),
            associated_token_address(&owner, &mint_b)
        );
    }
}
