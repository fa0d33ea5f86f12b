//! Chains the aligner across a list of modifications applied to one state
//! handle, and drives the stack-trie variant across a list of sequential
//! insertions.

use ethers::types::{H160, H256, U256};
use thiserror::Error;

use crate::aligner::{self, AlignError, PreimageOracle};
use crate::modification::TrieModification;
use crate::stack_trie::{self, StackTrieError};
use crate::witness::{EndNode, ModificationKind, StartNode, WitnessNode};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Align(#[from] AlignError),
    #[error(transparent)]
    StackTrie(#[from] StackTrieError),
    #[error("state oracle is unavailable: {0}")]
    OracleUnavailable(String),
    #[error("state invariant broken: {0}")]
    StateInvariantBroken(String),
}

/// One proof materialization result: the raw node list, the full 64-nibble
/// path the proof was taken over, and an optional sibling/neighbor node
/// (hashed or inline) relevant to insertions and deletions.
#[derive(Debug, Clone)]
pub struct ProofResult {
    pub proof: Vec<Vec<u8>>,
    pub key_nibbles: Vec<u8>,
    pub neighbor_node: Option<Vec<u8>>,
}

/// The external account/storage state the driver reads proofs from and
/// applies modifications to.
pub trait StateOracle {
    fn get_proof(&mut self, address: H160) -> Result<ProofResult, DriverError>;
    fn get_storage_proof(&mut self, address: H160, key: H256) -> Result<ProofResult, DriverError>;
    fn intermediate_root(&mut self) -> [u8; 32];
    fn set_nonce(&mut self, address: H160, nonce: u64);
    fn set_balance(&mut self, address: H160, balance: U256);
    fn set_code_hash(&mut self, address: H160, code_hash: H256);
    fn set_state(&mut self, address: H160, key: H256, value: H256);
    fn create_account(&mut self, address: H160, nonce: u64, balance: U256, code_hash: H256);
    fn delete_account(&mut self, address: H160);
}

/// One stack-trie insertion step.
#[derive(Debug, Clone)]
pub struct StackProofStep {
    pub s_proof: Vec<Vec<u8>>,
    pub c_proof: Vec<Vec<u8>>,
    pub key_nibbles: Vec<u8>,
    pub pre_root: [u8; 32],
    pub post_root: [u8; 32],
}

pub trait StackTrieProofs {
    fn insert_and_get_proof(&mut self, index: u64, rlp: &[u8]) -> Result<StackProofStep, DriverError>;
}

fn apply_modification(state: &mut impl StateOracle, modification: &TrieModification) {
    match modification {
        TrieModification::NonceChanged { address, nonce } => state.set_nonce(*address, *nonce),
        TrieModification::BalanceChanged { address, balance } => state.set_balance(*address, *balance),
        TrieModification::CodeHashChanged { address, code_hash } => {
            state.set_code_hash(*address, *code_hash)
        }
        TrieModification::AccountDestructed { address } => state.delete_account(*address),
        TrieModification::AccountDoesNotExist { .. } => {}
        TrieModification::StorageChanged {
            address,
            storage_key,
            value,
        } => state.set_state(*address, *storage_key, *value),
        TrieModification::StorageDoesNotExist { .. } => {}
        TrieModification::AccountCreate {
            address,
            nonce,
            balance,
            code_hash,
        } => state.create_account(*address, *nonce, *balance, *code_hash),
        TrieModification::TransactionInsertion { .. } => {}
    }
}

fn choose_neighbor(pre: &ProofResult, post: &ProofResult) -> Option<Vec<u8>> {
    match post.proof.len().cmp(&pre.proof.len()) {
        std::cmp::Ordering::Greater => post.neighbor_node.clone(),
        std::cmp::Ordering::Less => pre.neighbor_node.clone(),
        std::cmp::Ordering::Equal => post.neighbor_node.clone().or_else(|| pre.neighbor_node.clone()),
    }
}

fn storage_key_of(modification: &TrieModification) -> Option<[u8; 32]> {
    match modification {
        TrieModification::StorageChanged { storage_key, .. }
        | TrieModification::StorageDoesNotExist { storage_key, .. } => Some(storage_key.0),
        _ => None,
    }
}

/// Applies each modification in order to `state`, emitting the chained
/// witness stream. `StartNode.post_root` of one modification equals the
/// next modification's `StartNode.pre_root`, because both are read from the
/// same mutated `state` handle.
pub fn drive_modifications(
    state: &mut impl StateOracle,
    oracle: &impl PreimageOracle,
    modifications: &[TrieModification],
) -> Result<Vec<WitnessNode>, DriverError> {
    let mut out = Vec::new();
    let mut expected_pre_root: Option<[u8; 32]> = None;

    for modification in modifications {
        let kind = ModificationKind::from(modification);
        let address = modification.address();

        let pre_account = match address {
            Some(addr) => Some(state.get_proof(addr)?),
            None => None,
        };
        let pre_storage = match (modification.is_storage(), address) {
            (true, Some(addr)) => storage_key_of(modification)
                .map(|key| state.get_storage_proof(addr, H256::from(key)))
                .transpose()?,
            _ => None,
        };

        let pre_root = state.intermediate_root();
        if let Some(expected) = expected_pre_root {
            if expected != pre_root {
                return Err(DriverError::StateInvariantBroken(
                    "state root does not chain from the previous modification's post-root".into(),
                ));
            }
        }

        apply_modification(state, modification);
        let post_root = state.intermediate_root();

        let post_account = match address {
            Some(addr) => Some(state.get_proof(addr)?),
            None => None,
        };
        let post_storage = match (modification.is_storage(), address) {
            (true, Some(addr)) => storage_key_of(modification)
                .map(|key| state.get_storage_proof(addr, H256::from(key)))
                .transpose()?,
            _ => None,
        };

        log::debug!("processed modification {kind:?} for {address:?}");

        out.push(WitnessNode::Start(StartNode {
            pre_root,
            post_root,
            kind,
            special_test: 0,
        }));

        if let (Some(pre), Some(post)) = (&pre_account, &post_account) {
            let neighbor = choose_neighbor(pre, post);
            let is_non_existing = matches!(modification, TrieModification::AccountDoesNotExist { .. });
            let rows = aligner::convert_proof_to_witness(
                &pre.proof,
                &post.proof,
                &post.key_nibbles,
                neighbor,
                is_non_existing,
                None,
                oracle,
            )?;
            out.extend(rows);
        }

        if let (Some(pre), Some(post)) = (&pre_storage, &post_storage) {
            let neighbor = choose_neighbor(pre, post);
            let is_non_existing = matches!(modification, TrieModification::StorageDoesNotExist { .. });
            let rows = aligner::convert_proof_to_witness(
                &pre.proof,
                &post.proof,
                &post.key_nibbles,
                neighbor,
                is_non_existing,
                storage_key_of(modification),
                oracle,
            )?;
            out.extend(rows);
        }

        out.push(WitnessNode::End(EndNode {
            pre_root,
            post_root,
            kind,
        }));
        expected_pre_root = Some(post_root);
    }

    Ok(out)
}

/// Drives the stack-trie variant across `items` (one RLP-encoded value per
/// sequential index, e.g. transactions), wrapping each insertion in its own
/// `StartNode`/`EndNode` pair the same way `drive_modifications` does.
pub fn drive_stack_trie(
    stack: &mut impl StackTrieProofs,
    items: &[Vec<u8>],
) -> Result<Vec<WitnessNode>, DriverError> {
    let mut out = Vec::new();
    for (index, rlp) in items.iter().enumerate() {
        let step = stack.insert_and_get_proof(index as u64, rlp)?;
        log::debug!("stack-trie insertion {index} processed");

        out.push(WitnessNode::Start(StartNode {
            pre_root: step.pre_root,
            post_root: step.post_root,
            kind: ModificationKind::TransactionInsertion,
            special_test: 0,
        }));

        let rows = stack_trie::convert_stack_proof_to_witness(&step.s_proof, &step.c_proof, &step.key_nibbles)?;
        if rows.is_empty() {
            log::warn!("stack-trie insertion {index} produced no witness rows");
        }
        out.extend(rows);

        out.push(WitnessNode::End(EndNode {
            pre_root: step.pre_root,
            post_root: step.post_root,
            kind: ModificationKind::TransactionInsertion,
        }));
    }
    Ok(out)
}
