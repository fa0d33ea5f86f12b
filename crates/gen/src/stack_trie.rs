//! Stack-trie variant of the two-proof aligner: sequential, monotonically
//! increasing key insertions (transaction/receipt tries) follow a much more
//! restricted set of shape transitions than the general case, so this walks
//! the same common-prefix idea with a narrower dispatch.

use mpt_witness_codec::{classify, extract_ext_nibbles, DecodedNode, NodeKind};
use thiserror::Error;

use crate::builder::{fold_extension_into_branch, prepare_branch_node, prepare_tx_leaf_node, BuilderError};
use crate::witness::{ModifiedExtensionRider, ModifiedSide, WitnessNode};

/// The node kind at the tail of one side of a stack-trie proof step, named
/// rather than carried around as a raw `{1,2,3,4}` type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Branch,
    Extension,
    Leaf,
    Hashed,
}

impl ShapeKind {
    /// Maps the `StackTrieProofs` wire type code ({1,2,3,4}) to a
    /// `ShapeKind`.
    pub fn from_code(code: u8) -> Result<Self, StackTrieError> {
        Ok(match code {
            1 => ShapeKind::Branch,
            2 => ShapeKind::Extension,
            3 => ShapeKind::Leaf,
            4 => ShapeKind::Hashed,
            other => return Err(StackTrieError::UnknownTypeCode(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum StackTrieError {
    #[error("malformed RLP node encoding")]
    MalformedEncoding,
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Node(#[from] mpt_witness_codec::NodeError),
    #[error(transparent)]
    Nibble(#[from] mpt_witness_codec::NibbleError),
    #[error("stack-trie type code {0} is not one of {{1,2,3,4}}")]
    UnknownTypeCode(u8),
    #[error("stack-trie proof has no elements")]
    EmptyProof,
    #[error("target key nibbles exhausted before the proof did")]
    KeyExhausted,
    #[error("stack-trie proof shrank from {0} to {1} elements; insertions only grow a proof")]
    UnexpectedShrink(usize, usize),
    #[error("proof has a leaf node before its final element at index {0}")]
    UnexpectedLeafInPrefix(usize),
    #[error("expected the pre-insertion proof to end in a leaf, found a different shape")]
    ExpectedLeafAtEnd,
    #[error("unhandled stack-trie shape combination ({0:?}, {1:?})")]
    UnhandledShape(Option<ShapeKind>, ShapeKind),
}

fn decode_node(bytes: &[u8]) -> Result<DecodedNode, StackTrieError> {
    rlp::Rlp::new(bytes)
        .as_list::<Vec<u8>>()
        .map_err(|_| StackTrieError::MalformedEncoding)
}

/// Converts one sequential-insertion step's pre/post proof pair into witness
/// rows, dispatching on the proof-length delta and the tail node shapes.
///
/// `key_nibbles` is the new key's 64-nibble path (for transaction/receipt
/// tries, `keybytes_to_hex(rlp::encode(&index))`).
pub fn convert_stack_proof_to_witness(
    s_proof: &[Vec<u8>],
    c_proof: &[Vec<u8>],
    key_nibbles: &[u8],
) -> Result<Vec<WitnessNode>, StackTrieError> {
    if s_proof.is_empty() {
        let pre_kind = None;
        let post_items = decode_node(c_proof.last().ok_or(StackTrieError::EmptyProof)?)?;
        let post_kind = classify(&post_items).map_err(StackTrieError::Node)?;
        if post_kind != NodeKind::Leaf {
            return Err(StackTrieError::UnhandledShape(pre_kind, to_shape_kind(post_kind)));
        }
        // empty -> Leaf: the very first insertion.
        let leaf = prepare_tx_leaf_node(
            vec![],
            c_proof.last().unwrap().clone(),
            key_nibbles.to_vec(),
            None,
            false,
            true,
            false,
        )?;
        return Ok(vec![WitnessNode::TxLeaf(leaf)]);
    }

    let len_s = s_proof.len();
    let len_c = c_proof.len();

    if len_c < len_s {
        return Err(StackTrieError::UnexpectedShrink(len_s, len_c));
    }

    if len_c == len_s {
        // Branch–...–Branch -> same chain + Leaf is the growth case below;
        // an unchanged length means only the tail leaf's value differs.
        let leaf = prepare_tx_leaf_node(
            s_proof.last().unwrap().clone(),
            c_proof.last().unwrap().clone(),
            key_nibbles.to_vec(),
            None,
            false,
            false,
            false,
        )?;
        return Ok(vec![WitnessNode::TxLeaf(leaf)]);
    }

    // Growth: walk the prefix shared with the pre-insertion proof (all but
    // its last element, which is the leaf being displaced), then emit the
    // branch/leaf pair that replaces it.
    let mut key_index = 0usize;
    let mut rows = Vec::new();
    let mut pending_extension: Option<(Vec<u8>, Vec<u8>, DecodedNode, DecodedNode)> = None;

    for i in 0..len_s - 1 {
        let s_items = decode_node(&s_proof[i])?;
        match classify(&s_items).map_err(StackTrieError::Node)? {
            NodeKind::Branch => {
                let modified_index = *key_nibbles.get(key_index).ok_or(StackTrieError::KeyExhausted)?;
                let extension = pending_extension
                    .take()
                    .map(|(sb, cb, si, ci)| fold_extension_into_branch(sb, cb, &si, &ci))
                    .transpose()?;
                let branch = prepare_branch_node(
                    s_proof[i].clone(),
                    c_proof[i].clone(),
                    extension,
                    modified_index,
                    None,
                    false,
                    false,
                )?;
                rows.push(WitnessNode::Branch(branch));
                key_index += 1;
            }
            NodeKind::Extension => {
                let nibbles = extract_ext_nibbles(&s_items[0])?;
                key_index += nibbles.len();
                let c_items = decode_node(&c_proof[i])?;
                pending_extension = Some((s_proof[i].clone(), c_proof[i].clone(), s_items, c_items));
            }
            NodeKind::Leaf => return Err(StackTrieError::UnexpectedLeafInPrefix(i)),
        }
    }

    let old_leaf = s_proof.last().unwrap().clone();
    let old_leaf_items = decode_node(&old_leaf)?;
    if classify(&old_leaf_items).map_err(StackTrieError::Node)? != NodeKind::Leaf {
        return Err(StackTrieError::ExpectedLeafAtEnd);
    }

    // Ext–Branch -> Branch–Leaf (mod-ext): the pending extension's shared
    // prefix shortened to make room for the new branch fork.
    let mod_rider = match &pending_extension {
        Some((s_bytes, c_bytes, s_items, c_items)) => {
            let s_nibbles = extract_ext_nibbles(&s_items[0])?;
            let c_nibbles = extract_ext_nibbles(&c_items[0])?;
            if s_nibbles.len() == c_nibbles.len() {
                None
            } else {
                Some(ModifiedExtensionRider {
                    extension_before: s_bytes.clone(),
                    extension_after: c_bytes.clone(),
                    nibble_count: s_nibbles.len().max(c_nibbles.len()),
                    modified_side: ModifiedSide::C,
                })
            }
        }
        None => None,
    };

    let modified_index = *key_nibbles.get(key_index).ok_or(StackTrieError::KeyExhausted)?;

    // The drifted sibling's slot comes from the pre-existing leaf being
    // displaced (`old_leaf_items`), not from the new key's own nibble at
    // this level — those are the two distinct slots a branch insertion
    // always produces.
    let drifted_nibbles = extract_ext_nibbles(&old_leaf_items[0])?;
    let drifted_index = *drifted_nibbles.first().ok_or(StackTrieError::KeyExhausted)?;

    let extension = pending_extension
        .take()
        .map(|(sb, cb, si, ci)| fold_extension_into_branch(sb, cb, &si, &ci))
        .transpose()?;
    let branch_c_bytes = c_proof[len_s - 1].clone();
    let branch = prepare_branch_node(
        vec![],
        branch_c_bytes,
        extension,
        modified_index,
        Some(drifted_index),
        true,
        false,
    )?;
    rows.push(WitnessNode::Branch(branch));

    let new_leaf_bytes = c_proof.last().unwrap().clone();
    let mut leaf = prepare_tx_leaf_node(
        old_leaf.clone(),
        new_leaf_bytes,
        key_nibbles.to_vec(),
        Some(old_leaf),
        true,
        false,
        false,
    )?;
    if let Some(rider) = mod_rider {
        leaf.mod_extension = Some(rider);
    }
    rows.push(WitnessNode::TxLeaf(leaf));

    Ok(rows)
}

fn to_shape_kind(kind: NodeKind) -> ShapeKind {
    match kind {
        NodeKind::Branch => ShapeKind::Branch,
        NodeKind::Extension => ShapeKind::Extension,
        NodeKind::Leaf => ShapeKind::Leaf,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf_fixture() -> Vec<u8> {
        hex::decode("f869a0335649db80be637d281db0cc5896b0ff9869d08379a80fdc38dd073bba633949b846f8440101a08afc95b7d18a226944b9c2070b6bda1c3a36afcc3730429d47579c94b9fe5850a0ce92c756baff35fa740c3557c1a971fd24d2d35b7c8e067880d50cd86bb0bc99").unwrap()
    }

    #[test]
    fn test_first_insertion_emits_leaf_only() {
        let leaf = leaf_fixture();
        let key_nibbles = vec![0u8; 64];
        let rows = convert_stack_proof_to_witness(&[], &[leaf], &key_nibbles).unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            WitnessNode::TxLeaf(tx) => {
                assert!(tx.is_placeholder_s);
                assert!(!tx.is_placeholder_c);
            }
            other => panic!("expected TxLeaf, got {other:?}"),
        }
    }

    #[test]
    fn test_shape_kind_from_code() {
        assert_eq!(ShapeKind::from_code(1).unwrap(), ShapeKind::Branch);
        assert_eq!(ShapeKind::from_code(4).unwrap(), ShapeKind::Hashed);
        assert!(matches!(
            ShapeKind::from_code(5),
            Err(StackTrieError::UnknownTypeCode(5))
        ));
    }

    #[test]
    fn test_unexpected_shrink_errors() {
        let leaf = leaf_fixture();
        let key_nibbles = vec![0u8; 64];
        let result = convert_stack_proof_to_witness(&[leaf.clone(), leaf.clone()], &[leaf], &key_nibbles);
        assert!(matches!(result, Err(StackTrieError::UnexpectedShrink(2, 1))));
    }

    fn encode_leaf(nibbles: &[u8], value: &[u8]) -> Vec<u8> {
        let compact = mpt_witness_codec::nibbles_to_compact(nibbles, mpt_witness_codec::TargetNodeEncoding::Leaf)
            .unwrap();
        let mut stream = rlp::RlpStream::new_list(2);
        stream.append(&compact);
        stream.append(&value.to_vec());
        stream.out().to_vec()
    }

    fn encode_extension(nibbles: &[u8], child: &[u8]) -> Vec<u8> {
        let compact =
            mpt_witness_codec::nibbles_to_compact(nibbles, mpt_witness_codec::TargetNodeEncoding::Extension)
                .unwrap();
        let mut stream = rlp::RlpStream::new_list(2);
        stream.append(&compact);
        stream.append(&child.to_vec());
        stream.out().to_vec()
    }

    fn encode_branch(children: Vec<Vec<u8>>, value: Vec<u8>) -> Vec<u8> {
        assert_eq!(children.len(), 16);
        let mut stream = rlp::RlpStream::new_list(17);
        for child in &children {
            stream.append(child);
        }
        stream.append(&value);
        stream.out().to_vec()
    }

    #[test]
    fn test_second_insertion_splits_leaf_into_branch() {
        let old_leaf = encode_leaf(&[9], &[0xAA]);
        let branch_new = encode_branch(vec![vec![]; 16], vec![]);
        let new_leaf = encode_leaf(&[], &[0xBB]);
        let mut key_nibbles = vec![0u8; 64];
        key_nibbles[0] = 2;

        let rows =
            convert_stack_proof_to_witness(&[old_leaf.clone()], &[branch_new.clone(), new_leaf.clone()], &key_nibbles)
                .unwrap();

        assert_eq!(rows.len(), 2);
        match &rows[0] {
            WitnessNode::Branch(b) => {
                assert!(b.is_placeholder_s);
                assert!(!b.is_placeholder_c);
                assert_eq!(b.modified_index, 2);
                assert_eq!(b.drifted_index, Some(9));
            }
            other => panic!("expected Branch, got {other:?}"),
        }
        match &rows[1] {
            WitnessNode::TxLeaf(leaf) => {
                assert!(!leaf.is_placeholder_s);
                assert!(!leaf.is_placeholder_c);
                assert!(leaf.is_branch_in_row);
                assert_eq!(leaf.s_bytes, old_leaf);
                assert_eq!(leaf.c_bytes, new_leaf);
                assert_eq!(leaf.drifted_neighbor, Some(old_leaf.clone()));
            }
            other => panic!("expected TxLeaf, got {other:?}"),
        }
    }

    #[test]
    fn test_insertion_under_shortened_extension_splits_leaf_and_attaches_rider() {
        let ext_s = encode_extension(&[0xa, 0xb], &[0x01]);
        let ext_c = encode_extension(&[0xa], &[0x02]);
        let old_leaf = encode_leaf(&[6], &[0xCC]);
        let branch_new = encode_branch(vec![vec![]; 16], vec![]);
        let new_leaf = encode_leaf(&[], &[0xDD]);
        let mut key_nibbles = vec![0u8; 64];
        key_nibbles[2] = 4;

        let rows = convert_stack_proof_to_witness(
            &[ext_s.clone(), old_leaf.clone()],
            &[ext_c.clone(), branch_new.clone(), new_leaf.clone()],
            &key_nibbles,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        match &rows[0] {
            WitnessNode::Branch(b) => {
                assert!(b.is_placeholder_s);
                assert!(!b.is_placeholder_c);
                assert_eq!(b.modified_index, 4);
                assert_eq!(b.drifted_index, Some(6));
                assert!(b.extension.is_some());
            }
            other => panic!("expected Branch, got {other:?}"),
        }
        match &rows[1] {
            WitnessNode::TxLeaf(leaf) => {
                assert_eq!(leaf.s_bytes, old_leaf);
                assert_eq!(leaf.c_bytes, new_leaf);
                let rider = leaf.mod_extension.as_ref().expect("expected modified extension rider");
                assert_eq!(rider.nibble_count, 2);
                assert_eq!(rider.modified_side, ModifiedSide::C);
                assert_eq!(rider.extension_before, ext_s);
                assert_eq!(rider.extension_after, ext_c);
            }
            other => panic!("expected TxLeaf, got {other:?}"),
        }
    }
}
