// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Streaming proof-of-retention responses. The farmer rebuilds the audit
//! tree from the leaves persisted in the contract, streams the shard
//! through a fresh challenge hasher and emits the branch connecting its
//! response to the tree root as a nested pair structure.

use super::{build_levels, decode_leaves, pad_leaves, CHALLENGE_LEN};
use crate::crypto::hash160;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Invalid challenge encoding: {0}")]
    BadChallenge(String),
    #[error("Invalid audit leaf encoding: {0}")]
    BadLeaf(String),
    #[error("Challenge response does not map to a known audit leaf")]
    LeafNotFound,
    #[error("Malformed proof structure: {0}")]
    Malformed(&'static str),
}

/// One node of a branch proof.
///
/// The wire form is a nested JSON array: plain hex strings for sibling
/// hashes, two-element arrays for pairs, and a single-element array
/// holding the raw challenge response at the innermost position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofNode {
    /// An opaque sibling digest copied out of the tree.
    Hash([u8; 20]),
    /// A left/right pairing one level up the tree.
    Pair(Box<ProofNode>, Box<ProofNode>),
    /// The raw `SHA256(challenge || shard)` response at the bottom.
    Data([u8; 32]),
}

impl ProofNode {
    /// Serialize to the wire's nested-array form.
    pub fn to_value(&self) -> Value {
        match self {
            ProofNode::Hash(digest) => Value::String(hex::encode(digest)),
            ProofNode::Data(response) => Value::Array(vec![Value::String(hex::encode(response))]),
            ProofNode::Pair(left, right) => {
                Value::Array(vec![left.to_value(), right.to_value()])
            }
        }
    }

    /// Parse the wire's nested-array form.
    pub fn from_value(value: &Value) -> Result<Self, ProofError> {
        match value {
            Value::String(s) => {
                let bytes = hex::decode(s)
                    .map_err(|_| ProofError::Malformed("sibling hash is not hex"))?;
                let digest = <[u8; 20]>::try_from(bytes.as_slice())
                    .map_err(|_| ProofError::Malformed("sibling hash length"))?;
                Ok(ProofNode::Hash(digest))
            }
            Value::Array(items) => match items.as_slice() {
                [Value::String(s)] => {
                    let bytes = hex::decode(s)
                        .map_err(|_| ProofError::Malformed("response is not hex"))?;
                    let response = <[u8; 32]>::try_from(bytes.as_slice())
                        .map_err(|_| ProofError::Malformed("response length"))?;
                    Ok(ProofNode::Data(response))
                }
                [left, right] => Ok(ProofNode::Pair(
                    Box::new(ProofNode::from_value(left)?),
                    Box::new(ProofNode::from_value(right)?),
                )),
                _ => Err(ProofError::Malformed("array arity")),
            },
            _ => Err(ProofError::Malformed("unexpected JSON node")),
        }
    }
}

/// One-pass proof generator for a single challenge.
///
/// Linear like its counterpart generator: consume the shard bytes with
/// [`ProofStream::write`], then [`ProofStream::finish`] exactly once.
pub struct ProofStream {
    hasher: Sha256,
    bottom: Vec<[u8; 20]>,
}

impl ProofStream {
    /// `leaves` is the public record persisted in the contract;
    /// `challenge` the auditor's hex challenge.
    pub fn new(leaves: &[String], challenge: &str) -> Result<Self, ProofError> {
        let challenge =
            hex::decode(challenge).map_err(|e| ProofError::BadChallenge(e.to_string()))?;
        if challenge.len() != CHALLENGE_LEN {
            return Err(ProofError::BadChallenge(format!(
                "challenge length {}",
                challenge.len()
            )));
        }
        let decoded = decode_leaves(leaves).map_err(|e| ProofError::BadLeaf(e.to_string()))?;
        if decoded.is_empty() {
            return Err(ProofError::LeafNotFound);
        }
        let bottom = pad_leaves(decoded);

        let mut hasher = Sha256::new();
        hasher.update(&challenge);
        Ok(ProofStream { hasher, bottom })
    }

    /// Feed the next run of shard bytes.
    pub fn write(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Finalize into the nested branch proof.
    pub fn finish(self) -> Result<ProofNode, ProofError> {
        let response: [u8; 32] = self.hasher.finalize().into();
        let leaf = hash160(&response);
        let input = hash160(&leaf);

        let levels = build_levels(self.bottom);
        let mut index = levels[0]
            .iter()
            .position(|node| *node == input)
            .ok_or(ProofError::LeafNotFound)?;

        // Wrap the response level by level: the sibling joins on the
        // side the index dictates, then the index halves.
        let mut branch = ProofNode::Data(response);
        for level in &levels[..levels.len() - 1] {
            let sibling = ProofNode::Hash(level[index ^ 1]);
            branch = if index % 2 == 0 {
                ProofNode::Pair(Box::new(branch), Box::new(sibling))
            } else {
                ProofNode::Pair(Box::new(sibling), Box::new(branch))
            };
            index /= 2;
        }
        Ok(branch)
    }
}

/// Collapse a branch proof and return `(expected_root, computed_root)`
/// as hex strings. The caller asserts equality; returning both sides
/// keeps success and mismatch diagnostics in one helper.
///
/// `depth` is the level count recorded alongside the root; the proof's
/// nesting must match it exactly.
pub fn verify_proof(
    proof: &ProofNode,
    root: &str,
    depth: usize,
) -> Result<(String, String), ProofError> {
    if branch_depth(proof)? + 1 != depth {
        return Err(ProofError::Malformed("nesting does not match tree depth"));
    }
    let computed = collapse(proof)?;
    Ok((root.to_owned(), hex::encode(computed)))
}

fn collapse(node: &ProofNode) -> Result<[u8; 20], ProofError> {
    match node {
        // The response hashes twice on its way into the tree: once to
        // the challenge leaf, once to the recorded level.
        ProofNode::Data(response) => Ok(hash160(&hash160(response))),
        ProofNode::Hash(digest) => Ok(*digest),
        ProofNode::Pair(left, right) => {
            let mut concat = [0u8; 40];
            concat[..20].copy_from_slice(&collapse(left)?);
            concat[20..].copy_from_slice(&collapse(right)?);
            Ok(hash160(&concat))
        }
    }
}

/// Number of pair levels along the challenge branch.
fn branch_depth(node: &ProofNode) -> Result<usize, ProofError> {
    match node {
        ProofNode::Data(_) => Ok(0),
        ProofNode::Hash(_) => Err(ProofError::Malformed("branch ends in a bare hash")),
        ProofNode::Pair(left, right) => {
            match (contains_branch(left), contains_branch(right)) {
                (true, false) => Ok(1 + branch_depth(left)?),
                (false, true) => Ok(1 + branch_depth(right)?),
                _ => Err(ProofError::Malformed("branch is not a single path")),
            }
        }
    }
}

fn contains_branch(node: &ProofNode) -> bool {
    match node {
        ProofNode::Data(_) => true,
        ProofNode::Hash(_) => false,
        ProofNode::Pair(left, right) => contains_branch(left) || contains_branch(right),
    }
}
