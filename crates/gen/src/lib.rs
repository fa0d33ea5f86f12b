//! Node builders, the two-proof aligner, the stack-trie variant, and the
//! modification driver that chains them across a list of edits.
//!
//! This crate knows about witnesses and modifications; `mpt_witness_codec`
//! only knows about nibbles and node shapes.

pub mod aligner;
pub mod builder;
pub mod driver;
pub mod modification;
pub mod stack_trie;
pub mod witness;

pub use aligner::{convert_proof_to_witness, AlignError, PreimageOracle};
pub use driver::{drive_modifications, drive_stack_trie, DriverError, ProofResult, StackProofStep, StackTrieProofs, StateOracle};
pub use modification::TrieModification;
pub use stack_trie::{convert_stack_proof_to_witness, ShapeKind, StackTrieError};
pub use witness::{
    AccountLeafNode, BranchNode, EmbeddedExtension, EndNode, ExtensionView, ModificationKind,
    ModifiedExtensionRider, ModifiedSide, StartNode, StorageLeafNode, TxLeafNode, WitnessNode,
};
