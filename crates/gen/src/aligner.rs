//! The two-proof aligner: walks the common prefix of a pre-state (S) and
//! post-state (C) proof pair over the same key, detects where they diverge,
//! and dispatches to the node builders to emit one witness row per trie
//! level.

use mpt_witness_codec::{classify, extract_ext_nibbles, Child, DecodedNode, NodeKind};
use thiserror::Error;

use crate::builder::{
    equip_leaf_with_mod_extension_node, fold_extension_into_branch, prepare_account_leaf_node,
    prepare_account_leaf_placeholder_node, prepare_branch_node, prepare_storage_leaf_node,
    prepare_storage_leaf_placeholder_node, BuilderError,
};
use crate::witness::{EmbeddedExtension, ModifiedExtensionRider, ModifiedSide, WitnessNode};

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("malformed RLP node encoding")]
    MalformedEncoding,
    #[error(transparent)]
    Builder(#[from] BuilderError),
    #[error(transparent)]
    Node(#[from] mpt_witness_codec::NodeError),
    #[error(transparent)]
    Nibble(#[from] mpt_witness_codec::NibbleError),
    #[error("non-existence witness over an empty trie requires a neighbor node to duplicate as the wrong leaf")]
    MissingWrongLeaf,
    #[error("target key nibbles exhausted before the proof did")]
    KeyExhausted,
    #[error("proof has a leaf node before its final element at index {0}")]
    UnexpectedLeafInPrefix(usize),
    #[error("proof ends in an extension node but the witness is not for a non-existing key")]
    UnexpectedExtensionAtEnd,
    #[error("proof pair has a shape this aligner does not recognize")]
    UnsupportedShape,
}

/// Resolves a `Hashed` child reference to its preimage; returns the bytes
/// unchanged when the reference is already inline.
pub trait PreimageOracle {
    fn preimage(&self, hash: [u8; 32]) -> Option<Vec<u8>>;
}

/// Owned, short-lived aligner state: the nibble cursor and a pending
/// extension node waiting to be folded into the branch beneath it. Built
/// once per `convert_proof_to_witness` call and discarded on return.
#[derive(Debug, Default)]
struct AlignContext {
    key_index: usize,
    pending_extension: Option<PendingExtension>,
}

#[derive(Debug)]
struct PendingExtension {
    s_bytes: Vec<u8>,
    c_bytes: Vec<u8>,
    s_items: DecodedNode,
    c_items: DecodedNode,
}

fn decode_node(bytes: &[u8]) -> Result<DecodedNode, AlignError> {
    rlp::Rlp::new(bytes)
        .as_list::<Vec<u8>>()
        .map_err(|_| AlignError::MalformedEncoding)
}

fn resolve_neighbor(
    neighbor_node: Option<Vec<u8>>,
    oracle: &dyn PreimageOracle,
) -> Option<Vec<u8>> {
    let bytes = neighbor_node?;
    match Child::from_item(&bytes).ok().flatten() {
        Some(Child::Hashed(hash)) => oracle.preimage(hash),
        Some(Child::Inline(inline)) => Some(inline),
        None => None,
    }
}

fn build_leaf_row(
    s_bytes: Vec<u8>,
    c_bytes: Vec<u8>,
    neighbor: Option<Vec<u8>>,
    key_nibbles: &[u8],
    storage_key: Option<[u8; 32]>,
    is_placeholder_s: bool,
    is_placeholder_c: bool,
    is_non_existing: bool,
) -> Result<WitnessNode, AlignError> {
    Ok(match storage_key {
        Some(key) => WitnessNode::StorageLeaf(prepare_storage_leaf_node(
            s_bytes,
            c_bytes,
            neighbor,
            key_nibbles.to_vec(),
            key,
            is_placeholder_s,
            is_placeholder_c,
            is_non_existing,
        )?),
        None => WitnessNode::AccountLeaf(prepare_account_leaf_node(
            s_bytes,
            c_bytes,
            neighbor,
            key_nibbles.to_vec(),
            is_placeholder_s,
            is_placeholder_c,
            is_non_existing,
        )?),
    })
}

fn build_placeholder_leaf_row(
    key_nibbles: &[u8],
    storage_key: Option<[u8; 32]>,
) -> Result<WitnessNode, AlignError> {
    Ok(match storage_key {
        Some(key) => WitnessNode::StorageLeaf(prepare_storage_leaf_placeholder_node(
            key_nibbles.to_vec(),
            key,
            false,
            true,
        )?),
        None => WitnessNode::AccountLeaf(prepare_account_leaf_placeholder_node(
            key_nibbles.to_vec(),
            false,
            true,
        )?),
    })
}

fn attach_mod_extension(leaf: WitnessNode, rider: ModifiedExtensionRider) -> WitnessNode {
    match leaf {
        WitnessNode::AccountLeaf(node) => WitnessNode::AccountLeaf(equip_leaf_with_mod_extension_node(
            node,
            rider.extension_before,
            rider.extension_after,
            rider.nibble_count,
            rider.modified_side,
        )),
        WitnessNode::StorageLeaf(node) => WitnessNode::StorageLeaf(equip_leaf_with_mod_extension_node(
            node,
            rider.extension_before,
            rider.extension_after,
            rider.nibble_count,
            rider.modified_side,
        )),
        other => other,
    }
}

fn fold_pending(ctx: &mut AlignContext) -> Result<Option<EmbeddedExtension>, AlignError> {
    match ctx.pending_extension.take() {
        None => Ok(None),
        Some(pending) => Ok(Some(fold_extension_into_branch(
            pending.s_bytes,
            pending.c_bytes,
            &pending.s_items,
            &pending.c_items,
        )?)),
    }
}

/// Detects a modified extension node: the longer proof's penultimate
/// element is an extension whose nibble count differs
/// from the analogous level on the shorter side (or is absent there
/// entirely), meaning the extension was created or shortened by this
/// modification.
fn detect_modified_extension(
    shorter_proof: &[Vec<u8>],
    longer_proof: &[Vec<u8>],
    shorter_is_s: bool,
) -> Result<Option<ModifiedExtensionRider>, AlignError> {
    if longer_proof.len() < 2 {
        return Ok(None);
    }
    let penultimate_index = longer_proof.len() - 2;
    let long_items = decode_node(&longer_proof[penultimate_index])?;
    if classify(&long_items)? != NodeKind::Extension {
        return Ok(None);
    }
    let long_nibbles = extract_ext_nibbles(&long_items[0])?;

    let short_nibbles = if penultimate_index < shorter_proof.len() {
        let short_items = decode_node(&shorter_proof[penultimate_index])?;
        if classify(&short_items)? == NodeKind::Extension {
            extract_ext_nibbles(&short_items[0])?
        } else {
            vec![]
        }
    } else {
        vec![]
    };

    if long_nibbles.len() == short_nibbles.len() {
        return Ok(None);
    }

    let longer_bytes = longer_proof[penultimate_index].clone();
    let shorter_bytes = shorter_proof
        .get(penultimate_index)
        .cloned()
        .unwrap_or_default();
    let nibble_count = long_nibbles.len().max(short_nibbles.len());
    let (extension_before, extension_after, modified_side) = if shorter_is_s {
        (shorter_bytes, longer_bytes, ModifiedSide::C)
    } else {
        (longer_bytes, shorter_bytes, ModifiedSide::S)
    };
    Ok(Some(ModifiedExtensionRider {
        extension_before,
        extension_after,
        nibble_count,
        modified_side,
    }))
}

/// Walks a pair of aligned S/C proofs over the same key and emits the
/// witness rows covering every level.
///
/// `storage_key`, when `Some`, selects the storage-leaf builders and carries
/// the original (unhashed) storage slot; `None` selects the account-leaf
/// builders.
pub fn convert_proof_to_witness(
    s_proof: &[Vec<u8>],
    c_proof: &[Vec<u8>],
    target_key_nibbles: &[u8],
    neighbor_node: Option<Vec<u8>>,
    is_non_existing: bool,
    storage_key: Option<[u8; 32]>,
    oracle: &dyn PreimageOracle,
) -> Result<Vec<WitnessNode>, AlignError> {
    let mut rows = Vec::new();

    // Empty-trie special case: when both proofs are empty, the trie has a
    // single account (the supplied neighbor) standing in as the wrong leaf
    // on both sides.
    if s_proof.is_empty() && c_proof.is_empty() {
        let wrong_leaf = neighbor_node.ok_or(AlignError::MissingWrongLeaf)?;
        rows.push(build_leaf_row(
            wrong_leaf.clone(),
            wrong_leaf,
            None,
            target_key_nibbles,
            storage_key,
            true,
            true,
            true,
        )?);
        return Ok(rows);
    }

    let len_s = s_proof.len();
    let len_c = c_proof.len();
    let min_len = len_s.min(len_c);

    let additional_branch = len_s != len_c && len_s > 0 && len_c > 0 && {
        let shorter = if len_s < len_c { s_proof } else { c_proof };
        let last_items = decode_node(shorter.last().unwrap())?;
        classify(&last_items)? != NodeKind::Branch
    };

    let up_to = if additional_branch { min_len.saturating_sub(1) } else { min_len };

    let mut ctx = AlignContext::default();
    for i in 0..up_to {
        let s_bytes = &s_proof[i];
        let c_bytes = &c_proof[i];
        let s_items = decode_node(s_bytes)?;
        let c_items = decode_node(c_bytes)?;
        match classify(&s_items)? {
            NodeKind::Branch => {
                let modified_index = *target_key_nibbles
                    .get(ctx.key_index)
                    .ok_or(AlignError::KeyExhausted)?;
                let extension = fold_pending(&mut ctx)?;
                let branch = prepare_branch_node(
                    s_bytes.clone(),
                    c_bytes.clone(),
                    extension,
                    modified_index,
                    None,
                    false,
                    false,
                )?;
                rows.push(WitnessNode::Branch(branch));
                ctx.key_index += 1;
            }
            NodeKind::Extension => {
                let nibbles = extract_ext_nibbles(&s_items[0])?;
                ctx.key_index += nibbles.len();
                ctx.pending_extension = Some(PendingExtension {
                    s_bytes: s_bytes.clone(),
                    c_bytes: c_bytes.clone(),
                    s_items,
                    c_items,
                });
            }
            NodeKind::Leaf => return Err(AlignError::UnexpectedLeafInPrefix(i)),
        }
    }

    if len_s == len_c {
        let last_s = &s_proof[len_s - 1];
        let last_c = &c_proof[len_c - 1];
        let last_s_items = decode_node(last_s)?;
        let last_c_items = decode_node(last_c)?;
        match classify(&last_s_items)? {
            NodeKind::Leaf => {
                let neighbor = resolve_neighbor(neighbor_node, oracle);
                rows.push(build_leaf_row(
                    last_s.clone(),
                    last_c.clone(),
                    neighbor,
                    target_key_nibbles,
                    storage_key,
                    false,
                    false,
                    is_non_existing,
                )?);
            }
            NodeKind::Branch => {
                rows.push(build_placeholder_leaf_row(target_key_nibbles, storage_key)?);
            }
            NodeKind::Extension => {
                if !is_non_existing {
                    return Err(AlignError::UnexpectedExtensionAtEnd);
                }
                let extension =
                    fold_extension_into_branch(last_s.clone(), last_c.clone(), &last_s_items, &last_c_items)?;
                rows.push(build_leaf_row(
                    extension.s_bytes,
                    extension.c_bytes,
                    None,
                    target_key_nibbles,
                    storage_key,
                    false,
                    false,
                    true,
                )?);
            }
        }
        return Ok(rows);
    }

    if additional_branch {
        let shorter_is_s = len_s < len_c;
        let (shorter_proof, longer_proof) = if shorter_is_s {
            (s_proof, c_proof)
        } else {
            (c_proof, s_proof)
        };

        let leaf_row0 = longer_proof.last().unwrap();

        // The drifted sibling's slot comes from the shorter proof's last
        // element — the pre-existing leaf being displaced — not from the
        // newly-inserted leaf on the longer side, whose own remaining path
        // may be empty at this level (and says nothing about where the old
        // leaf lands).
        let drifted_leaf_items = decode_node(shorter_proof.last().unwrap())?;
        let drifted_nibbles = extract_ext_nibbles(&drifted_leaf_items[0])?;
        let drifted_index = *drifted_nibbles.first().ok_or(AlignError::KeyExhausted)?;

        let mod_extension = detect_modified_extension(shorter_proof, longer_proof, shorter_is_s)?;

        let modified_index = *target_key_nibbles
            .get(ctx.key_index)
            .ok_or(AlignError::KeyExhausted)?;
        let extension = fold_pending(&mut ctx)?;
        let branch_level_bytes = longer_proof[up_to].clone();
        let (s_branch_bytes, c_branch_bytes) = if shorter_is_s {
            (vec![], branch_level_bytes)
        } else {
            (branch_level_bytes, vec![])
        };
        let branch = prepare_branch_node(
            s_branch_bytes,
            c_branch_bytes,
            extension,
            modified_index,
            Some(drifted_index),
            shorter_is_s,
            !shorter_is_s,
        )?;
        rows.push(WitnessNode::Branch(branch));

        let neighbor = resolve_neighbor(neighbor_node, oracle);
        let (leaf_s_bytes, leaf_c_bytes) = if shorter_is_s {
            (vec![], leaf_row0.clone())
        } else {
            (leaf_row0.clone(), vec![])
        };
        let mut leaf = build_leaf_row(
            leaf_s_bytes,
            leaf_c_bytes,
            neighbor,
            target_key_nibbles,
            storage_key,
            shorter_is_s,
            !shorter_is_s,
            false,
        )?;
        if let Some(rider) = mod_extension {
            leaf = attach_mod_extension(leaf, rider);
        }
        rows.push(leaf);
        return Ok(rows);
    }

    Err(AlignError::UnsupportedShape)
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopOracle;
    impl PreimageOracle for NoopOracle {
        fn preimage(&self, _hash: [u8; 32]) -> Option<Vec<u8>> {
            None
        }
    }

    fn leaf_fixture() -> Vec<u8> {
        hex::decode("f869a0335649db80be637d281db0cc5896b0ff9869d08379a80fdc38dd073bba633949b846f8440101a08afc95b7d18a226944b9c2070b6bda1c3a36afcc3730429d47579c94b9fe5850a0ce92c756baff35fa740c3557c1a971fd24d2d35b7c8e067880d50cd86bb0bc99").unwrap()
    }

    fn branch_fixture() -> Vec<u8> {
        hex::decode("f901118080808080a00b1cd5a23994bc2aea49ae88d628bdfe9b4efb2b87a823094a83ed0e0fa013bc80a01b220b26c51916acd02c2e8492d76003c4f2d74b5575714846605cbe357155d68080a0162982546a8dcdc8b71661334851a2079867db4ac1bb2ec791921f8d16fa0a99a00113760f61a3340446e68233b923cc182d5584458f94217d68dde49e2d139dcaa0807b72d3c3a055ecb79ccf06c3234e6c17160bc96434dc5db4e8e1407c73e1aaa0340143d8c4052b29a57a409dcfce54ee187249048d5187a8ed8d79fb89cccce1a09809d25b91a2d1af6ff54188188bc056f9cf37ff28ed3d48ddd3fcc2c13a90d2a0dbba79570a67cf63a829507cf3cb03ead958cb4df306c12807001387b29e227c80").unwrap()
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
    fn test_storage_insertion_splits_leaf_into_branch() {
        let old_leaf = encode_leaf(&[1], &[0xAA]);
        let new_leaf = encode_leaf(&[], &[0xBB]);
        let branch = encode_branch(vec![vec![]; 16], vec![]);
        let target_key_nibbles = vec![2u8];

        let rows = convert_proof_to_witness(
            &[old_leaf.clone()],
            &[branch.clone(), new_leaf.clone()],
            &target_key_nibbles,
            None,
            false,
            Some([0xAAu8; 32]),
            &NoopOracle,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        match &rows[0] {
            WitnessNode::Branch(b) => {
                assert!(b.is_placeholder_s);
                assert!(!b.is_placeholder_c);
                assert_eq!(b.modified_index, 2);
                assert_eq!(b.drifted_index, Some(1));
            }
            other => panic!("expected Branch, got {other:?}"),
        }
        match &rows[1] {
            WitnessNode::StorageLeaf(leaf) => {
                assert!(leaf.is_placeholder_s);
                assert!(!leaf.is_placeholder_c);
                assert_eq!(leaf.c_bytes, new_leaf);
            }
            other => panic!("expected StorageLeaf, got {other:?}"),
        }
    }

    #[test]
    fn test_storage_deletion_collapses_branch_into_drifted_leaf() {
        let branch = encode_branch(vec![vec![]; 16], vec![]);
        let old_leaf_deleted = encode_leaf(&[5, 9], &[0xEE]);
        let drifted_leaf = encode_leaf(&[3], &[0xFF]);
        let target_key_nibbles = vec![7u8];

        let rows = convert_proof_to_witness(
            &[branch.clone(), old_leaf_deleted.clone()],
            &[drifted_leaf.clone()],
            &target_key_nibbles,
            None,
            false,
            Some([0xBBu8; 32]),
            &NoopOracle,
        )
        .unwrap();

        assert_eq!(rows.len(), 2);
        match &rows[0] {
            WitnessNode::Branch(b) => {
                assert!(!b.is_placeholder_s);
                assert!(b.is_placeholder_c);
                assert_eq!(b.modified_index, 7);
                assert_eq!(b.drifted_index, Some(3));
            }
            other => panic!("expected Branch, got {other:?}"),
        }
        match &rows[1] {
            WitnessNode::StorageLeaf(leaf) => {
                assert!(!leaf.is_placeholder_s);
                assert!(leaf.is_placeholder_c);
                assert_eq!(leaf.s_bytes, old_leaf_deleted);
            }
            other => panic!("expected StorageLeaf, got {other:?}"),
        }
    }

    #[test]
    fn test_insertion_with_modified_extension_node_attaches_rider() {
        let top_branch_s = encode_branch(vec![vec![]; 16], vec![]);
        let top_branch_c = encode_branch(vec![vec![]; 16], vec![]);
        let leaf_old = encode_leaf(&[7, 2], &[0xCC]);
        let ext_c = encode_extension(&[0xa], &[0x01]);
        let leaf_new = encode_leaf(&[], &[0xDD]);
        let target_key_nibbles = vec![3u8, 9u8];

        let rows = convert_proof_to_witness(
            &[top_branch_s, leaf_old.clone()],
            &[top_branch_c, ext_c.clone(), leaf_new.clone()],
            &target_key_nibbles,
            None,
            false,
            None,
            &NoopOracle,
        )
        .unwrap();

        assert_eq!(rows.len(), 3);
        match &rows[0] {
            WitnessNode::Branch(b) => {
                assert_eq!(b.modified_index, 3);
                assert_eq!(b.drifted_index, None);
            }
            other => panic!("expected Branch, got {other:?}"),
        }
        match &rows[1] {
            WitnessNode::Branch(b) => {
                assert!(b.is_placeholder_s);
                assert!(!b.is_placeholder_c);
                assert_eq!(b.modified_index, 9);
                assert_eq!(b.drifted_index, Some(7));
            }
            other => panic!("expected Branch, got {other:?}"),
        }
        match &rows[2] {
            WitnessNode::AccountLeaf(leaf) => {
                assert!(leaf.is_placeholder_s);
                assert!(!leaf.is_placeholder_c);
                assert_eq!(leaf.c_bytes, leaf_new);
                let rider = leaf.mod_extension.as_ref().expect("expected modified extension rider");
                assert_eq!(rider.nibble_count, 1);
                assert_eq!(rider.modified_side, ModifiedSide::C);
                assert_eq!(rider.extension_before, leaf_old);
                assert_eq!(rider.extension_after, ext_c);
            }
            other => panic!("expected AccountLeaf, got {other:?}"),
        }
    }

    #[test]
    fn test_equal_length_leaf_proofs_emit_one_leaf_row() {
        let leaf = leaf_fixture();
        let key_nibbles = vec![0u8; 64];
        let rows = convert_proof_to_witness(
            &[leaf.clone()],
            &[leaf.clone()],
            &key_nibbles,
            None,
            false,
            None,
            &NoopOracle,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(matches!(rows[0], WitnessNode::AccountLeaf(_)));
    }

    #[test]
    fn test_branch_with_nil_child_emits_placeholder_for_non_existence() {
        let branch = branch_fixture();
        let key_nibbles = vec![0u8; 64];
        let rows = convert_proof_to_witness(
            &[branch.clone()],
            &[branch.clone()],
            &key_nibbles,
            None,
            true,
            None,
            &NoopOracle,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(rows[0], WitnessNode::Branch(_)));
        match &rows[1] {
            WitnessNode::AccountLeaf(leaf) => {
                assert!(leaf.is_non_existing);
                assert!(leaf.is_placeholder_c);
            }
            other => panic!("expected placeholder account leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_trie_special_case_duplicates_wrong_leaf() {
        let leaf = leaf_fixture();
        let key_nibbles = vec![0u8; 64];
        let rows = convert_proof_to_witness(
            &[],
            &[],
            &key_nibbles,
            Some(leaf),
            true,
            None,
            &NoopOracle,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        match &rows[0] {
            WitnessNode::AccountLeaf(leaf) => {
                assert!(leaf.is_placeholder_s);
                assert!(leaf.is_placeholder_c);
                assert!(leaf.is_non_existing);
            }
            other => panic!("expected account leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_trie_special_case_requires_neighbor() {
        let key_nibbles = vec![0u8; 64];
        let result =
            convert_proof_to_witness(&[], &[], &key_nibbles, None, true, None, &NoopOracle);
        assert!(matches!(result, Err(AlignError::MissingWrongLeaf)));
    }

    #[test]
    fn test_resolve_neighbor_tolerates_missing_preimage() {
        let hashed_child = vec![0xabu8; 32];
        assert_eq!(resolve_neighbor(Some(hashed_child), &NoopOracle), None);
        assert_eq!(resolve_neighbor(None, &NoopOracle), None);
    }
}
