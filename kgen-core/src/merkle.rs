//! Merkle batch commitments over artifact digests

use serde::{Deserialize, Serialize};

use crate::error::{KgenError, KgenResult};
use crate::hashing::{hash_concat, HashAlgorithm};

/// One step on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    /// Hex digest of the sibling node.
    pub sibling: String,
    /// Whether the sibling sits to the right of the running hash.
    pub sibling_is_right: bool,
}

/// Inclusion proof for a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub path: Vec<ProofStep>,
}

/// A batch commitment: the root plus one proof per leaf, in leaf order.
#[derive(Debug, Clone)]
pub struct MerkleBatch {
    pub root: String,
    pub proofs: Vec<MerkleProof>,
}

/// Compute the root over leaves in insertion order.
///
/// Leaves are artifact digests and enter the tree as-is; interior nodes are
/// `H(left || right)` over raw digest bytes, with an odd tail duplicated.
pub fn merkle_root(algorithm: HashAlgorithm, leaves: &[String]) -> KgenResult<String> {
    Ok(build_batch(algorithm, leaves)?.root)
}

/// Build the root and an inclusion proof for every leaf.
pub fn build_batch(algorithm: HashAlgorithm, leaves: &[String]) -> KgenResult<MerkleBatch> {
    if leaves.is_empty() {
        return Err(KgenError::Integrity("merkle batch has no leaves".to_string()));
    }

    let mut level: Vec<Vec<u8>> = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        let bytes = hex::decode(leaf)
            .map_err(|e| KgenError::Integrity(format!("leaf is not hex: {}", e)))?;
        if bytes.len() != algorithm.digest_len() {
            return Err(KgenError::Integrity(format!(
                "leaf digest length {} does not match {}",
                bytes.len(),
                algorithm.as_str()
            )));
        }
        level.push(bytes);
    }

    let mut paths: Vec<Vec<ProofStep>> = vec![Vec::new(); leaves.len()];
    // Which tree node each original leaf currently sits under.
    let mut positions: Vec<usize> = (0..leaves.len()).collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let (left, right) = if pair.len() == 2 {
                (&pair[0], &pair[1])
            } else {
                (&pair[0], &pair[0])
            };
            next.push(hash_concat(algorithm, left, right));
        }

        for (leaf, pos) in positions.iter_mut().enumerate() {
            let sibling_index = *pos ^ 1;
            let sibling = if sibling_index < level.len() {
                &level[sibling_index]
            } else {
                // Odd tail: the node is paired with itself.
                &level[*pos]
            };
            paths[leaf].push(ProofStep {
                sibling: hex::encode(sibling),
                sibling_is_right: *pos % 2 == 0,
            });
            *pos /= 2;
        }

        level = next;
    }

    let root = hex::encode(&level[0]);
    let proofs = paths
        .into_iter()
        .enumerate()
        .map(|(i, path)| MerkleProof { leaf_index: i as u64, path })
        .collect();

    Ok(MerkleBatch { root, proofs })
}

/// Verify that `leaf` is committed under `root` by `proof`.
pub fn verify_proof(
    algorithm: HashAlgorithm,
    leaf: &str,
    proof: &MerkleProof,
    root: &str,
) -> bool {
    let Ok(mut running) = hex::decode(leaf) else {
        return false;
    };
    for step in &proof.path {
        let Ok(sibling) = hex::decode(&step.sibling) else {
            return false;
        };
        running = if step.sibling_is_right {
            hash_concat(algorithm, &running, &sibling)
        } else {
            hash_concat(algorithm, &sibling, &running)
        };
    }
    crate::hashing::constant_time_hex_eq(&hex::encode(running), root)
}
