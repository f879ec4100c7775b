//! Binary merkle trees and inclusion-proof operations.
//!
//! Trees are built over an ordered leaf sequence exactly as given: no
//! sorting, no deduplication. When a level has an odd node count the last
//! unpaired node is promoted unchanged to the next level. Inclusion proofs
//! are emitted as ordered operation lists that replay left to right:
//! `l` prepends a sibling to the accumulator, `r` appends one, `op` hashes
//! the accumulator. The same operation lists travel on the bus and inside
//! client-facing proofs, so [`replay`] is the single verification
//! primitive for every pipeline stage.

use serde::{Deserialize, Serialize};

use crate::crypto::{decode_value, sha256_bytes, sha256d_bytes};
use crate::error::CoreError;

// ════════════════════════════════════════════════════════════════════════════
// PROOF OPERATIONS
// ════════════════════════════════════════════════════════════════════════════

/// Internal hash function of a tree, named the way proofs name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashOp {
    #[serde(rename = "sha-256")]
    Sha256,
    /// Double SHA-256, as used by bitcoin transaction and header hashing.
    #[serde(rename = "sha-256-x2")]
    Sha256x2,
}

impl HashOp {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashOp::Sha256 => sha256_bytes(data).to_vec(),
            HashOp::Sha256x2 => sha256d_bytes(data).to_vec(),
        }
    }
}

/// One step of a proof segment.
///
/// Serializes to the single-key objects `{"l": ...}`, `{"r": ...}`,
/// `{"op": "sha-256"}` used on the wire. Values decode as hex when they
/// parse as hex, UTF-8 otherwise (see [`decode_value`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofOp {
    #[serde(rename = "l")]
    Left(String),
    #[serde(rename = "r")]
    Right(String),
    #[serde(rename = "op")]
    Hash(HashOp),
}

/// Replay a proof segment against a starting value.
///
/// Returns the final accumulator; verification compares it with the
/// expected downstream root or block hash.
pub fn replay(leaf: &[u8], ops: &[ProofOp]) -> Vec<u8> {
    let mut acc = leaf.to_vec();
    for op in ops {
        match op {
            ProofOp::Left(v) => {
                let mut joined = decode_value(v);
                joined.extend_from_slice(&acc);
                acc = joined;
            }
            ProofOp::Right(v) => {
                acc.extend_from_slice(&decode_value(v));
            }
            ProofOp::Hash(h) => {
                acc = h.digest(&acc);
            }
        }
    }
    acc
}

// ════════════════════════════════════════════════════════════════════════════
// MERKLE TREE
// ════════════════════════════════════════════════════════════════════════════

/// Merkle tree retaining every level so per-leaf proofs can be emitted
/// after the build.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Vec<u8>>>,
    op: HashOp,
}

impl MerkleTree {
    /// Build a tree over `leaves` in the given order.
    ///
    /// Leaves are used as-is (callers pass hashes or nonce bytes); they are
    /// not themselves hashed before pairing.
    pub fn build(leaves: Vec<Vec<u8>>, op: HashOp) -> Result<Self, CoreError> {
        if leaves.is_empty() {
            return Err(CoreError::Validation("merkle tree needs at least one leaf".into()));
        }

        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let current = levels.last().expect("non-empty levels");
            let mut next = Vec::with_capacity(current.len() / 2 + 1);
            let mut i = 0;
            while i < current.len() {
                if i + 1 < current.len() {
                    let mut joined = current[i].clone();
                    joined.extend_from_slice(&current[i + 1]);
                    next.push(op.digest(&joined));
                    i += 2;
                } else {
                    // odd node promotes unchanged
                    next.push(current[i].clone());
                    i += 1;
                }
            }
            levels.push(next);
        }

        Ok(MerkleTree { levels, op })
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn root(&self) -> &[u8] {
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Inclusion proof for the leaf at `index`, as wire operations.
    ///
    /// Siblings to the right of the current position yield `{r}`, siblings
    /// to the left yield `{l}`; a promoted node contributes no operations
    /// at that level.
    pub fn proof(&self, index: usize) -> Result<Vec<ProofOp>, CoreError> {
        if index >= self.leaf_count() {
            return Err(CoreError::Validation(format!(
                "leaf index {} out of range ({} leaves)",
                index,
                self.leaf_count()
            )));
        }

        let mut ops = Vec::new();
        let mut pos = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = pos ^ 1;
            if sibling < level.len() {
                let sib_hex = hex::encode(&level[sibling]);
                if sibling > pos {
                    ops.push(ProofOp::Right(sib_hex));
                } else {
                    ops.push(ProofOp::Left(sib_hex));
                }
                ops.push(ProofOp::Hash(self.op));
            }
            pos /= 2;
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| sha256_bytes(&[i as u8]).to_vec()).collect()
    }

    #[test]
    fn single_leaf_root_is_leaf() {
        let l = leaves(1);
        let tree = MerkleTree::build(l.clone(), HashOp::Sha256).unwrap();
        assert_eq!(tree.root(), l[0].as_slice());
        assert!(tree.proof(0).unwrap().is_empty());
    }

    #[test]
    fn two_leaf_root() {
        let l = leaves(2);
        let tree = MerkleTree::build(l.clone(), HashOp::Sha256).unwrap();
        let mut joined = l[0].clone();
        joined.extend_from_slice(&l[1]);
        assert_eq!(tree.root(), sha256_bytes(&joined).as_slice());
    }

    #[test]
    fn odd_leaf_promoted_unchanged() {
        // counts 1, 3, 5: the unpaired node must survive to the next level
        for n in [1usize, 3, 5] {
            let l = leaves(n);
            let tree = MerkleTree::build(l.clone(), HashOp::Sha256).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let ops = tree.proof(i).unwrap();
                assert_eq!(
                    replay(leaf, &ops),
                    tree.root().to_vec(),
                    "leaf {} of {} failed to replay",
                    i,
                    n
                );
            }
        }
    }

    #[test]
    fn proof_replay_law_various_sizes() {
        for n in [2usize, 4, 7, 16, 33] {
            let l = leaves(n);
            let tree = MerkleTree::build(l.clone(), HashOp::Sha256).unwrap();
            for (i, leaf) in l.iter().enumerate() {
                let ops = tree.proof(i).unwrap();
                assert_eq!(replay(leaf, &ops), tree.root().to_vec());
            }
        }
    }

    #[test]
    fn double_sha_tree_replays() {
        let l = leaves(3);
        let tree = MerkleTree::build(l.clone(), HashOp::Sha256x2).unwrap();
        let ops = tree.proof(1).unwrap();
        assert_eq!(replay(&l[1], &ops), tree.root().to_vec());
    }

    #[test]
    fn empty_leaves_rejected() {
        assert!(MerkleTree::build(Vec::new(), HashOp::Sha256).is_err());
    }

    #[test]
    fn proof_index_out_of_range() {
        let tree = MerkleTree::build(leaves(2), HashOp::Sha256).unwrap();
        assert!(tree.proof(2).is_err());
    }

    #[test]
    fn ops_serialize_as_single_key_objects() {
        let ops = vec![
            ProofOp::Left("ab".into()),
            ProofOp::Right("cd".into()),
            ProofOp::Hash(HashOp::Sha256),
            ProofOp::Hash(HashOp::Sha256x2),
        ];
        let json = serde_json::to_string(&ops).unwrap();
        assert_eq!(
            json,
            r#"[{"l":"ab"},{"r":"cd"},{"op":"sha-256"},{"op":"sha-256-x2"}]"#
        );
        let back: Vec<ProofOp> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ops);
    }
}
