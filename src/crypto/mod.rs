// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Hashing and recoverable ECDSA primitives shared by the contract and
//! audit subsystems. All protocol hashes bottom out in
//! `RIPEMD160(SHA256(x))`, written [`hash160`] here.

use libsecp256k1::{Message, PublicKey, RecoveryId, SecretKey, Signature as EcdsaSignature};
use rand::Rng;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Recoverable secp256k1 signature length: 1-byte recovery id prefix
/// followed by the 64-byte compact signature.
pub const RECOVERABLE_SIG_LEN: usize = 65;

/// Length of a hex-encoded [`hash160`] digest.
pub const HASH160_HEX_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid recoverable signature length. Was {0}, must be 65")]
    SignatureLength(usize),
    #[error("Invalid secret key bytes")]
    InvalidSecretKey,
    #[error("{0}")]
    Secp(String),
}

impl From<libsecp256k1::Error> for Error {
    fn from(e: libsecp256k1::Error) -> Self {
        Error::Secp(e.to_string())
    }
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// RIPEMD-160 digest of `data`. Mostly useful for callers that already
/// hold a SHA-256 digest from incremental hashing.
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `RIPEMD160(SHA256(data))`, the node combiner used throughout the
/// protocol for audit trees, shard hashes and node identifiers.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

/// Hex form of [`hash160`].
pub fn hash160_hex(data: &[u8]) -> String {
    hex::encode(hash160(data))
}

/// Produce a recoverable signature over a 32-byte digest. The recovery id
/// is prepended so a verifier can recover the public key without it being
/// transmitted separately.
pub fn sign_recoverable(secret: &SecretKey, digest: &[u8; 32]) -> [u8; RECOVERABLE_SIG_LEN] {
    let message = Message::parse(digest);
    let (signature, recovery_id) = libsecp256k1::sign(&message, secret);

    let mut bytes = [0u8; RECOVERABLE_SIG_LEN];
    bytes[0] = recovery_id.serialize();
    bytes[1..].copy_from_slice(&signature.serialize());
    bytes
}

/// Recover the signing public key from a digest and a recoverable
/// signature produced by [`sign_recoverable`].
pub fn recover_public_key(digest: &[u8; 32], signature: &[u8]) -> Result<PublicKey, Error> {
    if signature.len() != RECOVERABLE_SIG_LEN {
        return Err(Error::SignatureLength(signature.len()));
    }

    let recovery_id = RecoveryId::parse(signature[0])?;
    let message = Message::parse(digest);

    let mut compact = [0u8; 64];
    compact.copy_from_slice(&signature[1..]);
    let signature = EcdsaSignature::parse_standard(&compact)?;

    Ok(libsecp256k1::recover(&message, &signature, &recovery_id)?)
}

/// Short node identifier bound to a public key: `hash160` of the
/// compressed key serialization, hex encoded.
pub fn public_key_hash(public: &PublicKey) -> String {
    hex::encode(hash160(&public.serialize_compressed()))
}

/// A secp256k1 keypair identifying one network peer.
#[derive(Clone)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let secret = SecretKey::random(rng);
        let public = PublicKey::from_secret_key(&secret);
        Keypair { secret, public }
    }

    /// Rebuild a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, Error> {
        let secret = SecretKey::parse(bytes).map_err(|_| Error::InvalidSecretKey)?;
        let public = PublicKey::from_secret_key(&secret);
        Ok(Keypair { secret, public })
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The peer's 40-hex node id, `hash160` of the compressed public key.
    pub fn node_id(&self) -> String {
        public_key_hash(&self.public)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish()
    }
}
