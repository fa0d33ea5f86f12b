//! Pure functions that assemble one witness row from raw encoded S/C nodes
//! and the local context the aligner has already determined (which child
//! index was touched, whether either side is a placeholder, ...).
//!
//! None of these functions look at a second node to decide anything; all
//! dispatch has already happened in the aligner. They only attach the
//! framing the circuit needs.

use mpt_witness_codec::{extract_ext_nibbles, nibbles_to_compact, DecodedNode, TargetNodeEncoding};
use thiserror::Error;

use crate::witness::{
    AccountLeafNode, BranchNode, EmbeddedExtension, ExtensionView, ModifiedExtensionRider,
    ModifiedSide, StorageLeafNode, TxLeafNode,
};

#[derive(Debug, Error, Eq, PartialEq)]
pub enum BuilderError {
    #[error("branch child index {0} is out of range (must be 0..=15)")]
    InvalidChildIndex(u8),
    #[error("a branch cannot be a placeholder on both the S and C side")]
    BothSidesPlaceholder,
    #[error("leaf key path must be at most 64 nibbles, got {0}")]
    KeyPathTooLong(usize),
    #[error("extension node must have exactly 2 items, got {0}")]
    ExtensionItemCount(usize),
    #[error("nibble error {0}")]
    Nibble(#[from] mpt_witness_codec::NibbleError),
}

/// Builds a branch-level witness row. When `extension` is `Some`, the
/// extension node immediately above this branch is folded into the same
/// row instead of emitted separately.
pub fn prepare_branch_node(
    s_bytes: Vec<u8>,
    c_bytes: Vec<u8>,
    extension: Option<EmbeddedExtension>,
    modified_index: u8,
    drifted_index: Option<u8>,
    is_placeholder_s: bool,
    is_placeholder_c: bool,
) -> Result<BranchNode, BuilderError> {
    if modified_index > 15 {
        return Err(BuilderError::InvalidChildIndex(modified_index));
    }
    if let Some(drifted) = drifted_index {
        if drifted > 15 {
            return Err(BuilderError::InvalidChildIndex(drifted));
        }
    }
    if is_placeholder_s && is_placeholder_c {
        return Err(BuilderError::BothSidesPlaceholder);
    }
    let is_extension = extension.is_some();
    Ok(BranchNode {
        s_bytes,
        c_bytes,
        extension,
        modified_index,
        drifted_index,
        is_placeholder_s,
        is_placeholder_c,
        is_extension,
    })
}

/// Parses an extension node's two items into nibble count, a path-RLP
/// framing byte string, and up to four parsed child-reference views (short
/// inline / long hashed, once for each of the S and C sides the caller is
/// folding in).
pub fn prepare_extensions(
    s_items: &DecodedNode,
    c_items: &DecodedNode,
) -> Result<(usize, Vec<u8>, [Option<ExtensionView>; 4]), BuilderError> {
    if s_items.len() != 2 {
        return Err(BuilderError::ExtensionItemCount(s_items.len()));
    }
    if c_items.len() != 2 {
        return Err(BuilderError::ExtensionItemCount(c_items.len()));
    }
    let s_nibbles = extract_ext_nibbles(&s_items[0])?;
    let nibble_count = s_nibbles.len();
    let path_rlp = rlp::encode(&s_items[0]).to_vec();

    let mut views: [Option<ExtensionView>; 4] = [None, None, None, None];
    let (s_short, s_long) = extension_child_view(&s_items[0], &s_items[1])?;
    views[0] = s_short;
    views[1] = s_long;
    let (c_short, c_long) = extension_child_view(&c_items[0], &c_items[1])?;
    views[2] = c_short;
    views[3] = c_long;

    Ok((nibble_count, path_rlp, views))
}

/// Classifies one side's extension child reference as a short (inline,
/// embedded RLP list) or long (32-byte hash reference) view.
fn extension_child_view(
    compact_path: &[u8],
    child: &[u8],
) -> Result<(Option<ExtensionView>, Option<ExtensionView>), BuilderError> {
    let nibbles = extract_ext_nibbles(compact_path)?;
    let view = ExtensionView {
        nibbles,
        compact_path: compact_path.to_vec(),
        list_rlp_bytes: child.to_vec(),
    };
    if child.len() == 32 {
        Ok((None, Some(view)))
    } else {
        Ok((Some(view), None))
    }
}

/// Builds the row folding an extension node into the branch beneath it,
/// given both sides' raw nodes (already classified as extensions by the
/// caller).
pub fn fold_extension_into_branch(
    s_ext_bytes: Vec<u8>,
    c_ext_bytes: Vec<u8>,
    s_items: &DecodedNode,
    c_items: &DecodedNode,
) -> Result<EmbeddedExtension, BuilderError> {
    let (_nibble_count, path_rlp, views) = prepare_extensions(s_items, c_items)?;
    Ok(EmbeddedExtension {
        s_bytes: s_ext_bytes,
        c_bytes: c_ext_bytes,
        path_rlp,
        views,
    })
}

fn check_key_path(key_nibbles: &[u8]) -> Result<(), BuilderError> {
    if key_nibbles.len() > 64 {
        return Err(BuilderError::KeyPathTooLong(key_nibbles.len()));
    }
    Ok(())
}

/// Builds an account leaf witness row.
pub fn prepare_account_leaf_node(
    s_bytes: Vec<u8>,
    c_bytes: Vec<u8>,
    drifted_neighbor: Option<Vec<u8>>,
    key_nibbles: Vec<u8>,
    is_placeholder_s: bool,
    is_placeholder_c: bool,
    is_non_existing: bool,
) -> Result<AccountLeafNode, BuilderError> {
    check_key_path(&key_nibbles)?;
    Ok(AccountLeafNode {
        s_bytes,
        c_bytes,
        drifted_neighbor,
        key_nibbles,
        is_placeholder_s,
        is_placeholder_c,
        is_non_existing,
        mod_extension: None,
    })
}

/// Builds a storage leaf witness row.
pub fn prepare_storage_leaf_node(
    s_bytes: Vec<u8>,
    c_bytes: Vec<u8>,
    drifted_neighbor: Option<Vec<u8>>,
    key_nibbles: Vec<u8>,
    storage_key: [u8; 32],
    is_placeholder_s: bool,
    is_placeholder_c: bool,
    is_non_existing: bool,
) -> Result<StorageLeafNode, BuilderError> {
    check_key_path(&key_nibbles)?;
    Ok(StorageLeafNode {
        s_bytes,
        c_bytes,
        drifted_neighbor,
        key_nibbles,
        storage_key,
        is_placeholder_s,
        is_placeholder_c,
        is_non_existing,
        mod_extension: None,
    })
}

/// Builds a placeholder account leaf row: no leaf exists on the side(s)
/// flagged, emitted purely to keep the circuit's row shape uniform when a
/// proof ends at a branch with a `nil` child.
pub fn prepare_account_leaf_placeholder_node(
    key_nibbles: Vec<u8>,
    is_placeholder_s: bool,
    is_placeholder_c: bool,
) -> Result<AccountLeafNode, BuilderError> {
    check_key_path(&key_nibbles)?;
    Ok(AccountLeafNode {
        s_bytes: vec![],
        c_bytes: vec![],
        drifted_neighbor: None,
        key_nibbles,
        is_placeholder_s,
        is_placeholder_c,
        is_non_existing: true,
        mod_extension: None,
    })
}

/// Builds a placeholder storage leaf row; see
/// [`prepare_account_leaf_placeholder_node`].
pub fn prepare_storage_leaf_placeholder_node(
    key_nibbles: Vec<u8>,
    storage_key: [u8; 32],
    is_placeholder_s: bool,
    is_placeholder_c: bool,
) -> Result<StorageLeafNode, BuilderError> {
    check_key_path(&key_nibbles)?;
    Ok(StorageLeafNode {
        s_bytes: vec![],
        c_bytes: vec![],
        drifted_neighbor: None,
        key_nibbles,
        storage_key,
        is_placeholder_s,
        is_placeholder_c,
        is_non_existing: true,
        mod_extension: None,
    })
}

/// Builds a stack-trie leaf row.
pub fn prepare_tx_leaf_node(
    s_bytes: Vec<u8>,
    c_bytes: Vec<u8>,
    key_nibbles: Vec<u8>,
    drifted_neighbor: Option<Vec<u8>>,
    is_branch_in_row: bool,
    is_placeholder_s: bool,
    is_placeholder_c: bool,
) -> Result<TxLeafNode, BuilderError> {
    check_key_path(&key_nibbles)?;
    Ok(TxLeafNode {
        s_bytes,
        c_bytes,
        key_nibbles,
        drifted_neighbor,
        is_branch_in_row,
        is_placeholder_s,
        is_placeholder_c,
        mod_extension: None,
    })
}

/// A leaf row that can carry a trailing modified-extension-node rider.
pub trait WithModExtension {
    fn set_mod_extension(&mut self, rider: ModifiedExtensionRider);
}

impl WithModExtension for AccountLeafNode {
    fn set_mod_extension(&mut self, rider: ModifiedExtensionRider) {
        self.mod_extension = Some(rider);
    }
}

impl WithModExtension for StorageLeafNode {
    fn set_mod_extension(&mut self, rider: ModifiedExtensionRider) {
        self.mod_extension = Some(rider);
    }
}

impl WithModExtension for TxLeafNode {
    fn set_mod_extension(&mut self, rider: ModifiedExtensionRider) {
        self.mod_extension = Some(rider);
    }
}

/// Attaches a [`ModifiedExtensionRider`] to an already-built leaf row. Rider
/// rows always follow their associated leaf row and never appear
/// standalone, hence attachment rather than a separate emitted node.
pub fn equip_leaf_with_mod_extension_node<L: WithModExtension>(
    mut leaf: L,
    extension_before: Vec<u8>,
    extension_after: Vec<u8>,
    nibble_count: usize,
    modified_side: ModifiedSide,
) -> L {
    leaf.set_mod_extension(ModifiedExtensionRider {
        extension_before,
        extension_after,
        nibble_count,
        modified_side,
    });
    leaf
}

/// Compact-encodes a leaf's remaining nibbles the way a leaf's first RLP
/// item is encoded; used by builders that must reconstruct a drifted leaf's
/// path rather than just pass bytes through.
pub fn leaf_compact_path(remaining_nibbles: &[u8]) -> Result<Vec<u8>, BuilderError> {
    Ok(nibbles_to_compact(remaining_nibbles, TargetNodeEncoding::Leaf)?)
}
