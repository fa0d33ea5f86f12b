//! Nibble arithmetic and Merkle PATRICIA Trie node classification.
//!
//! This crate has no knowledge of witnesses, modifications, or proofs at
//! large — it is the leaf-most layer of the workspace.

pub mod nibble;
pub mod node;

pub use nibble::{
    extract_ext_nibbles, keybytes_to_hex, nibbles_to_bytes, nibbles_to_compact, NibbleError,
    NibblePath, PathMatch, PrefixEncoding, TargetNodeEncoding,
};
pub use node::{classify, is_branch, Child, NodeError, NodeKind};

/// The raw RLP item list of one decoded trie node, as produced by
/// `rlp::decode_list` on one element of a proof.
pub type DecodedNode = Vec<Vec<u8>>;
