// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Retention audits. A renter generates a batch of random challenges and
//! feeds the shard through an [`AuditStream`] once, producing a Merkle
//! tree whose bottom level is published to the farmer inside the
//! contract while the challenges stay private. Later the farmer answers
//! a challenge by streaming the shard through a [`ProofStream`], and the
//! renter checks the resulting branch against the stored tree root.

mod proof;

pub use proof::{verify_proof, ProofError, ProofNode, ProofStream};

use crate::crypto::hash160;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Challenge length in bytes.
pub const CHALLENGE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Audit count must be greater than zero")]
    EmptyAudit,
    #[error("Invalid challenge encoding: {0}")]
    BadChallenge(String),
    #[error("Invalid audit leaf encoding: {0}")]
    BadLeaf(String),
}

/// The renter's private half of an audit tree.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub root: String,
    pub depth: usize,
    pub challenges: Vec<String>,
}

/// One-pass audit challenge generator.
///
/// Holds one incremental SHA-256 hasher per challenge, each pre-fed with
/// its challenge bytes, so a single pass over the shard computes every
/// challenge response. The stream is linear: [`AuditStream::finish`]
/// consumes it and the result is not restartable.
pub struct AuditStream {
    challenges: Vec<[u8; CHALLENGE_LEN]>,
    hashers: Vec<Sha256>,
}

impl AuditStream {
    /// Create a generator for `count` challenges using the process RNG.
    pub fn new(count: usize) -> Result<Self, Error> {
        Self::with_rng(count, &mut rand::thread_rng())
    }

    /// Create a generator with an explicit RNG, used by deterministic
    /// tests.
    pub fn with_rng<R: Rng>(count: usize, rng: &mut R) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::EmptyAudit);
        }

        let mut challenges = Vec::with_capacity(count);
        let mut hashers = Vec::with_capacity(count);
        for _ in 0..count {
            let mut challenge = [0u8; CHALLENGE_LEN];
            rng.fill_bytes(&mut challenge);

            let mut hasher = Sha256::new();
            hasher.update(challenge);
            challenges.push(challenge);
            hashers.push(hasher);
        }
        Ok(AuditStream {
            challenges,
            hashers,
        })
    }

    /// Feed the next run of shard bytes to every challenge hasher.
    pub fn write(&mut self, chunk: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.update(chunk);
        }
    }

    /// Finalize into the audit tree.
    pub fn finish(self) -> AuditTree {
        let leaves = self
            .hashers
            .into_iter()
            .map(|hasher| {
                let response: [u8; 32] = hasher.finalize().into();
                let leaf = hash160(&response);
                hash160(&leaf)
            })
            .collect();
        AuditTree::from_parts(self.challenges, leaves)
    }
}

/// A finalized audit Merkle tree.
///
/// `levels[0]` is the padded bottom level (the public record), the last
/// level holds the single root. Node combination is
/// `hash160(left || right)` over raw digest bytes.
pub struct AuditTree {
    challenges: Vec<[u8; CHALLENGE_LEN]>,
    levels: Vec<Vec<[u8; 20]>>,
}

impl AuditTree {
    fn from_parts(challenges: Vec<[u8; CHALLENGE_LEN]>, leaves: Vec<[u8; 20]>) -> Self {
        AuditTree {
            challenges,
            levels: build_levels(pad_leaves(leaves)),
        }
    }

    /// Rebuild verifier state from persisted challenges and the public
    /// leaves, skipping shard consumption entirely.
    pub fn from_records(challenges: &[String], leaves: &[String]) -> Result<Self, Error> {
        let challenges = challenges
            .iter()
            .map(|c| {
                let bytes = hex::decode(c).map_err(|e| Error::BadChallenge(e.to_string()))?;
                <[u8; CHALLENGE_LEN]>::try_from(bytes.as_slice())
                    .map_err(|_| Error::BadChallenge(format!("challenge length {}", c.len())))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let leaves = decode_leaves(leaves)?;
        if challenges.is_empty() || leaves.is_empty() {
            return Err(Error::EmptyAudit);
        }
        Ok(Self::from_parts(challenges, leaves))
    }

    /// The padded bottom level of the tree, hex encoded. This is what a
    /// renter embeds in the contract as `audit_leaves`.
    pub fn public_record(&self) -> Vec<String> {
        self.levels[0].iter().map(hex::encode).collect()
    }

    /// The private record the renter keeps: tree root, level count and
    /// the raw challenges.
    pub fn private_record(&self) -> AuditRecord {
        AuditRecord {
            root: self.root_hex(),
            depth: self.depth(),
            challenges: self.challenges.iter().map(hex::encode).collect(),
        }
    }

    /// Tree root, hex encoded.
    pub fn root_hex(&self) -> String {
        hex::encode(self.levels.last().expect("tree has at least one level")[0])
    }

    /// Number of levels, inclusive of the bottom leaves and the root.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Pad a bottom level with `hash160("")` up to the next power of two.
pub(crate) fn pad_leaves(mut leaves: Vec<[u8; 20]>) -> Vec<[u8; 20]> {
    let target = leaves.len().next_power_of_two();
    let filler = empty_leaf();
    leaves.resize(target, filler);
    leaves
}

/// The padding digest, `hash160` of the empty byte string.
pub(crate) fn empty_leaf() -> [u8; 20] {
    hash160(b"")
}

/// Build every Merkle level bottom-up from an already padded level.
pub(crate) fn build_levels(bottom: Vec<[u8; 20]>) -> Vec<Vec<[u8; 20]>> {
    debug_assert!(bottom.len().is_power_of_two());
    let mut levels = vec![bottom];
    while levels.last().expect("seeded with bottom level").len() > 1 {
        let previous = levels.last().expect("seeded with bottom level");
        let next = previous
            .chunks(2)
            .map(|pair| {
                let mut concat = [0u8; 40];
                concat[..20].copy_from_slice(&pair[0]);
                concat[20..].copy_from_slice(&pair[1]);
                hash160(&concat)
            })
            .collect();
        levels.push(next);
    }
    levels
}

pub(crate) fn decode_leaves(leaves: &[String]) -> Result<Vec<[u8; 20]>, Error> {
    leaves
        .iter()
        .map(|l| {
            let bytes = hex::decode(l).map_err(|e| Error::BadLeaf(e.to_string()))?;
            <[u8; 20]>::try_from(bytes.as_slice())
                .map_err(|_| Error::BadLeaf(format!("leaf length {}", l.len())))
        })
        .collect()
}

/// Challenge response for a full in-memory shard, `SHA256(challenge || shard)`.
#[cfg(test)]
pub(crate) fn challenge_response(challenge: &[u8], shard: &[u8]) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(challenge.len() + shard.len());
    preimage.extend_from_slice(challenge);
    preimage.extend_from_slice(shard);
    crate::crypto::sha256(&preimage)
}
