//! Accounts, rent and typed account state

use crate::{address::account_discriminator, EscrowError, EscrowResult};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use solana_pubkey::Pubkey;

pub const ACCOUNT_STORAGE_OVERHEAD: u64 = 128;
pub const LAMPORTS_PER_BYTE_YEAR: u64 = 3480;
pub const EXEMPTION_THRESHOLD_YEARS: u64 = 2;

/// Lamports an account of `data_len` bytes must hold to be rent exempt
pub fn rent_exempt_minimum(data_len: usize) -> u64 {
    (ACCOUNT_STORAGE_OVERHEAD + data_len as u64) * LAMPORTS_PER_BYTE_YEAR * EXEMPTION_THRESHOLD_YEARS
}

/// A ledger account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub lamports: u64,
    pub owner: Pubkey,
    pub data: Vec<u8>,
}

/// Typed state stored in account data as an 8-byte discriminator followed
/// by the bincode encoding
pub trait AccountState: Serialize + DeserializeOwned + Sized {
    /// Type name hashed into the discriminator
    const NAME: &'static str;

    fn discriminator() -> [u8; 8] {
        account_discriminator(Self::NAME)
    }

    fn to_account_data(&self) -> EscrowResult<Vec<u8>> {
        let mut data = Self::discriminator().to_vec();
        data.extend(bincode::serialize(self)?);
        Ok(data)
    }

    fn from_account_data(data: &[u8]) -> EscrowResult<Self> {
        if data.len() < 8 || data[..8] != Self::discriminator() {
            return Err(EscrowError::invalid_account(format!(
                "account data is not a {}",
                Self::NAME
            )));
        }
        Ok(bincode::deserialize(&data[8..])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    impl AccountState for Counter {
        const NAME: &'static str = "Counter";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Other {
        value: u64,
    }

    impl AccountState for Other {
        const NAME: &'static str = "Other";
    }

    #[test]
    fn test_discriminator_guards_decoding() {
        let data = Counter { value: 9 }.to_account_data().unwrap();
        assert_eq!(Counter::from_account_data(&data).unwrap(), Counter { value: 9 });
        assert!(matches!(
            Other::from_account_data(&data),
            Err(EscrowError::InvalidAccount(_))
        ));
    }

    #[test]
    fn test_rent_grows_with_size() {
        assert_eq!(rent_exempt_minimum(0), 128 * 3480 * 2);
        assert!(rent_exempt_minimum(165) > rent_exempt_minimum(82));
    }
}
