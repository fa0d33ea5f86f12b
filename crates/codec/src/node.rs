//! Classification of a single Merkle PATRICIA Trie node's RLP item list.

use thiserror::Error;

use crate::nibble::{NibbleError, PrefixEncoding};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum NodeError {
    #[error("node has no items")]
    NodeEmpty,
    #[error("node item has no encoding byte")]
    NoEncoding,
    #[error("node must have 17 (branch) or 2 (extension/leaf) items, got {0}")]
    InvalidItemCount(usize),
    #[error("nibble error {0}")]
    Nibble(#[from] NibbleError),
    #[error("branch child slot must be 32 bytes, got {0}")]
    InvalidChildLength(usize),
}

/// The shape of a trie node, determined from its decoded RLP item count and,
/// for 2-item nodes, the hex-prefix byte of the first item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Branch,
    Extension,
    Leaf,
}

/// A child reference held in a branch slot or as an extension's next node:
/// either small enough to embed inline in the parent's RLP, or referenced by
/// its keccak hash and requiring a preimage lookup to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Child {
    Inline(Vec<u8>),
    Hashed([u8; 32]),
}

impl Child {
    /// Classifies a raw branch-slot / extension-next-node item.
    pub fn from_item(item: &[u8]) -> Result<Option<Self>, NodeError> {
        if item.is_empty() {
            return Ok(None);
        }
        if item.len() == 32 {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(item);
            return Ok(Some(Child::Hashed(hash)));
        }
        Ok(Some(Child::Inline(item.to_vec())))
    }
}

/// Determines whether a decoded node (its list of RLP items) is a branch,
/// extension, or leaf.
///
/// A branch always has 17 items (16 children + a value slot). A 2-item node
/// is an extension or leaf depending on the hex-prefix nibble of its first
/// item's first byte.
pub fn classify(node_items: &[Vec<u8>]) -> Result<NodeKind, NodeError> {
    match node_items.len() {
        17 => Ok(NodeKind::Branch),
        2 => {
            let compact_path = node_items.first().ok_or(NodeError::NodeEmpty)?;
            let first_byte = *compact_path.first().ok_or(NodeError::NoEncoding)?;
            Ok(match PrefixEncoding::try_from(first_byte)? {
                PrefixEncoding::ExtensionEven | PrefixEncoding::ExtensionOdd(_) => {
                    NodeKind::Extension
                }
                PrefixEncoding::LeafEven | PrefixEncoding::LeafOdd(_) => NodeKind::Leaf,
            })
        }
        other => Err(NodeError::InvalidItemCount(other)),
    }
}

/// True iff the decoded node's item count makes it a branch (17 items).
pub fn is_branch(node_items: &[Vec<u8>]) -> bool {
    node_items.len() == 17
}
