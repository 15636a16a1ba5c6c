// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod clock;

pub use clock::{Clock, FixedClock, SystemClock};

/// Returns `true` if `s` is a lower-case hex string of exactly `len` characters.
pub fn is_hex_string(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Smallest power of two greater than or equal to `n`.
pub fn next_power_of_two(n: usize) -> usize {
    n.next_power_of_two()
}

/// Serde helpers for fields whose wire form is either a value or the JSON
/// literal `false` when unset. The contract schema uses `false` rather than
/// `null` for the HD key fields, and the sentinel takes part in the signed
/// canonical form, so the mapping has to be preserved exactly.
pub mod false_or {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(v) => v.serialize(serializer),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Bool(false) => Ok(None),
            serde_json::Value::Null => Ok(None),
            other => T::deserialize(other)
                .map(Some)
                .map_err(|e| D::Error::custom(e.to_string())),
        }
    }
}
