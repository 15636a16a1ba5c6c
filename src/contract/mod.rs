// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The storage contract: a fixed-schema agreement between a renter and a
//! farmer over a single shard. Contracts are exchanged as JSON, signed
//! over a canonical serialization and routed through criteria topics
//! derived from their size and duration.

mod topic;

pub use topic::{duration_degree, size_degree, Criteria, Degree, TOPIC_PREFIX};

use crate::crypto;
use crate::utils::{false_or, is_hex_string};
use libsecp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current contract schema version.
pub const CONTRACT_VERSION: u64 = 1;

/// Maximum serialized length of an HD extended public key.
pub const MAX_HD_KEY_LEN: usize = 111;

/// Highest allowed HD derivation index (hardened indices are excluded).
pub const MAX_HD_INDEX: u32 = i32::MAX as u32;

/// Fields a contract renewal is never allowed to change.
pub const RESTRICTED_RENEWAL_FIELDS: [&str; 6] = [
    "renter_id",
    "renter_hd_key",
    "farmer_id",
    "farmer_hd_key",
    "data_size",
    "data_hash",
];

/// Fields ignored when comparing two contracts for equivalence.
const COMPARE_IGNORED_FIELDS: [&str; 5] = [
    "renter_id",
    "renter_signature",
    "farmer_id",
    "farmer_signature",
    "payment_destination",
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid contract descriptor: {0}")]
    Schema(String),
    #[error("Cannot sign a contract with zero data_size")]
    ZeroDataSize,
    #[error("Contract field {0} is not set")]
    MissingField(&'static str),
    #[error("Signature encoding: {0}")]
    SignatureEncoding(#[from] base64::DecodeError),
    #[error(transparent)]
    Crypto(#[from] crypto::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Schema(e.to_string())
    }
}

/// The two signing parties of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureRole {
    Renter,
    Farmer,
}

impl SignatureRole {
    fn id_field(&self) -> &'static str {
        match self {
            SignatureRole::Renter => "renter_id",
            SignatureRole::Farmer => "farmer_id",
        }
    }
}

/// A storage agreement over a single shard.
///
/// Integer fields are non-negative, hex fields are lower-case without
/// prefix, and the HD key fields serialize as the JSON literal `false`
/// when unset. Unknown keys are dropped whenever a contract is built or
/// patched from JSON, so they can never leak into the signed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub renter_id: Option<String>,
    #[serde(default, with = "false_or")]
    pub renter_hd_key: Option<String>,
    #[serde(default, with = "false_or")]
    pub renter_hd_index: Option<u32>,
    #[serde(default)]
    pub renter_signature: Option<String>,
    #[serde(default)]
    pub farmer_id: Option<String>,
    #[serde(default, with = "false_or")]
    pub farmer_hd_key: Option<String>,
    #[serde(default, with = "false_or")]
    pub farmer_hd_index: Option<u32>,
    #[serde(default)]
    pub farmer_signature: Option<String>,
    #[serde(default)]
    pub data_size: u64,
    #[serde(default)]
    pub data_hash: Option<String>,
    #[serde(default)]
    pub store_begin: u64,
    #[serde(default)]
    pub store_end: u64,
    #[serde(default)]
    pub audit_count: u64,
    #[serde(default)]
    pub audit_leaves: Vec<String>,
    #[serde(default)]
    pub payment_storage_price: u64,
    #[serde(default)]
    pub payment_download_price: u64,
    #[serde(default)]
    pub payment_destination: Option<String>,
}

fn default_version() -> u64 {
    CONTRACT_VERSION
}

impl Default for Contract {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .expect("empty object satisfies the contract schema")
    }
}

impl Contract {
    /// Build a contract from arbitrary JSON, dropping unknown keys and
    /// merging schema defaults for the missing ones.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        if !value.is_object() {
            return Err(Error::Schema("descriptor must be an object".into()));
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Read a single field by its canonical key name.
    pub fn get(&self, field: &str) -> Option<Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get(field).cloned(),
            _ => None,
        }
    }

    /// Set a single field by its canonical key name. Unknown keys are
    /// silently dropped, matching the schema-cleaning rule.
    pub fn set(&mut self, field: &str, value: Value) -> Result<(), Error> {
        let mut patch = serde_json::Map::new();
        patch.insert(field.to_owned(), value);
        self.update(&Value::Object(patch))
    }

    /// Apply a JSON object as a patch. Every mutation re-runs schema
    /// cleaning so unknown keys never persist.
    pub fn update(&mut self, patch: &Value) -> Result<(), Error> {
        let object = patch
            .as_object()
            .ok_or_else(|| Error::Schema("patch must be an object".into()))?;

        let mut merged = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => unreachable!("contracts serialize as objects"),
        };
        for (key, value) in object {
            merged.insert(key.clone(), value.clone());
        }
        *self = serde_json::from_value(Value::Object(merged))?;
        Ok(())
    }

    /// The canonical signing form: compact JSON with both signature
    /// fields removed and object keys in stable sorted order. Signing and
    /// verification always operate on these bytes.
    pub fn signing_data(&self) -> Vec<u8> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => unreachable!("contracts serialize as objects"),
        };
        map.remove("renter_signature");
        map.remove("farmer_signature");
        // serde_json maps are BTreeMap-backed, so serialization emits keys
        // in sorted order.
        serde_json::to_vec(&Value::Object(map)).expect("canonical form serializes")
    }

    /// SHA-256 of the canonical form; the digest both parties sign.
    pub fn signing_hash(&self) -> [u8; 32] {
        crypto::sha256(&self.signing_data())
    }

    /// Sign the contract as `role`, storing the recoverable signature
    /// base64-encoded in the role's signature field. Signing does not
    /// require the contract to be valid, but refuses an empty shard.
    pub fn sign(&mut self, role: SignatureRole, secret: &SecretKey) -> Result<(), Error> {
        if self.data_size == 0 {
            return Err(Error::ZeroDataSize);
        }

        let digest = self.signing_hash();
        let signature = crypto::sign_recoverable(secret, &digest);
        let encoded = base64_encode(&signature);
        match role {
            SignatureRole::Renter => self.renter_signature = Some(encoded),
            SignatureRole::Farmer => self.farmer_signature = Some(encoded),
        }
        Ok(())
    }

    /// Verify the signature held for `role`: the public key recovered
    /// from the signature must hash to the claimed party id, and the
    /// signature must verify over the canonical form. Both checks must
    /// pass.
    pub fn verify(&self, role: SignatureRole) -> bool {
        let (id, signature) = match role {
            SignatureRole::Renter => (&self.renter_id, &self.renter_signature),
            SignatureRole::Farmer => (&self.farmer_id, &self.farmer_signature),
        };
        let (Some(id), Some(signature)) = (id, signature) else {
            return false;
        };
        let Ok(bytes) = base64_decode(signature) else {
            return false;
        };

        let digest = self.signing_hash();
        let Ok(public) = crypto::recover_public_key(&digest, &bytes) else {
            return false;
        };
        if crypto::public_key_hash(&public) != *id {
            return false;
        }

        // Recovery already walked the curve, but the claimed signature is
        // still checked against the recovered key explicitly.
        let message = libsecp256k1::Message::parse(&digest);
        let Ok(signature) = libsecp256k1::Signature::parse_standard(
            bytes[1..].try_into().expect("length checked on recovery"),
        ) else {
            return false;
        };
        libsecp256k1::verify(&message, &signature, &public)
    }

    /// Whether every present field matches the schema constraints.
    pub fn is_valid(&self) -> bool {
        let hex_id_ok = |id: &Option<String>| id.as_ref().map_or(true, |v| is_hex_string(v, 40));
        let hd_key_ok = |key: &Option<String>| {
            key.as_ref()
                .map_or(true, |v| v.len() <= MAX_HD_KEY_LEN && bs58::decode(v).into_vec().is_ok())
        };
        let hd_index_ok =
            |index: &Option<u32>| index.as_ref().map_or(true, |v| *v <= MAX_HD_INDEX);
        let signature_ok = |sig: &Option<String>| {
            sig.as_ref().map_or(true, |v| {
                base64_decode(v).map(|b| b.len() == crypto::RECOVERABLE_SIG_LEN) == Ok(true)
            })
        };

        hex_id_ok(&self.renter_id)
            && hex_id_ok(&self.farmer_id)
            && hd_key_ok(&self.renter_hd_key)
            && hd_key_ok(&self.farmer_hd_key)
            && hd_index_ok(&self.renter_hd_index)
            && hd_index_ok(&self.farmer_hd_index)
            && signature_ok(&self.renter_signature)
            && signature_ok(&self.farmer_signature)
            && self
                .data_hash
                .as_ref()
                .map_or(true, |v| is_hex_string(v, 40))
            && self.store_begin < self.store_end
            && self.audit_leaves.iter().all(|l| is_hex_string(l, 40))
    }

    /// Valid, and no nullable field left unset. Complete contracts carry
    /// both parties and both signatures and are treated as immutable.
    pub fn is_complete(&self) -> bool {
        self.is_valid()
            && self.renter_id.is_some()
            && self.farmer_id.is_some()
            && self.renter_signature.is_some()
            && self.farmer_signature.is_some()
            && self.data_hash.is_some()
            && self.payment_destination.is_some()
    }

    /// The 5-byte criteria topic with default availability and speed.
    pub fn topic_bytes(&self) -> [u8; 5] {
        self.topic_bytes_with(&Criteria::default())
    }

    /// The 5-byte criteria topic for explicit availability and speed
    /// degrees. Size and duration degrees always derive from the
    /// contract itself.
    pub fn topic_bytes_with(&self, criteria: &Criteria) -> [u8; 5] {
        let duration = self.store_end.saturating_sub(self.store_begin);
        [
            TOPIC_PREFIX,
            size_degree(self.data_size) as u8,
            duration_degree(duration) as u8,
            criteria.availability as u8,
            criteria.speed as u8,
        ]
    }

    /// Hex form of the criteria topic, the pub/sub routing identifier.
    pub fn topic_hex(&self) -> String {
        hex::encode(self.topic_bytes())
    }

    /// Equality after stripping the party-specific fields. Two parties
    /// negotiating the same terms compare equal even before either side
    /// has signed.
    pub fn compare(a: &Contract, b: &Contract) -> bool {
        let strip = |c: &Contract| {
            let mut map = match serde_json::to_value(c) {
                Ok(Value::Object(map)) => map,
                _ => unreachable!("contracts serialize as objects"),
            };
            for field in COMPARE_IGNORED_FIELDS {
                map.remove(field);
            }
            map
        };
        strip(a) == strip(b)
    }

    /// Names of the fields that differ between two contracts, in
    /// canonical key order. Drives the renewal policy.
    pub fn diff(a: &Contract, b: &Contract) -> Vec<String> {
        let to_map = |c: &Contract| match serde_json::to_value(c) {
            Ok(Value::Object(map)) => map,
            _ => unreachable!("contracts serialize as objects"),
        };
        let (a, b) = (to_map(a), to_map(b));
        a.iter()
            .filter(|(key, value)| b.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// The id field for `role`, required before verification.
    pub fn party_id(&self, role: SignatureRole) -> Result<&str, Error> {
        let id = match role {
            SignatureRole::Renter => &self.renter_id,
            SignatureRole::Farmer => &self.farmer_id,
        };
        id.as_deref().ok_or(Error::MissingField(role.id_field()))
    }

    /// The `data_hash` field, required by every shard operation.
    pub fn data_hash(&self) -> Result<&str, Error> {
        self.data_hash
            .as_deref()
            .ok_or(Error::MissingField("data_hash"))
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}
