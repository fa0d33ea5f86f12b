//! Facade crate: re-exports the codec and witness-generation crates under
//! one name.
//!
//! `mpt_witness_codec` is the leaf-most layer (nibble arithmetic, node
//! classification); `mpt_witness_gen` builds on it with the node builders,
//! the two-proof aligner, the stack-trie variant, and the modification
//! driver. Integration tests exercising the end-to-end scenarios live under
//! `tests/`.

pub use mpt_witness_codec::*;
pub use mpt_witness_gen::*;
