//! A single edit to be applied to the trie, and the shape of witness it asks
//! the driver to produce.

use ethers::types::{H160, H256, U256};

/// One requested edit to account or storage state.
///
/// Each kind carries only the fields it needs, rather than one struct with
/// a field per possible edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrieModification {
    NonceChanged { address: H160, nonce: u64 },
    BalanceChanged { address: H160, balance: U256 },
    CodeHashChanged { address: H160, code_hash: H256 },
    AccountDestructed { address: H160 },
    AccountDoesNotExist { address: H160 },
    StorageChanged {
        address: H160,
        storage_key: H256,
        value: H256,
    },
    StorageDoesNotExist { address: H160, storage_key: H256 },
    AccountCreate {
        address: H160,
        nonce: u64,
        balance: U256,
        code_hash: H256,
    },
    TransactionInsertion { index: u64, rlp: Vec<u8> },
}

impl TrieModification {
    /// The address this modification concerns, for kinds that have one.
    pub fn address(&self) -> Option<H160> {
        match self {
            TrieModification::NonceChanged { address, .. }
            | TrieModification::BalanceChanged { address, .. }
            | TrieModification::CodeHashChanged { address, .. }
            | TrieModification::AccountDestructed { address }
            | TrieModification::AccountDoesNotExist { address }
            | TrieModification::StorageChanged { address, .. }
            | TrieModification::StorageDoesNotExist { address, .. }
            | TrieModification::AccountCreate { address, .. } => Some(*address),
            TrieModification::TransactionInsertion { .. } => None,
        }
    }

    /// True for modifications that read state but never mutate it
    /// (`AccountDoesNotExist`, `StorageDoesNotExist`, `TransactionInsertion`
    /// against the stack trie which is insert-only and driven separately).
    pub fn mutates_state(&self) -> bool {
        !matches!(
            self,
            TrieModification::AccountDoesNotExist { .. }
                | TrieModification::StorageDoesNotExist { .. }
        )
    }

    /// True for modifications whose proof is over a storage slot rather than
    /// an account.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            TrieModification::StorageChanged { .. } | TrieModification::StorageDoesNotExist { .. }
        )
    }
}
