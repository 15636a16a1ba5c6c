// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Criteria topic encoding. A contract is routed through the pub/sub
//! overlay under a 5-byte identifier: a fixed prefix followed by one
//! degree byte per criteria axis (size, duration, availability, speed).

use serde::{Deserialize, Serialize};

/// Leading byte of every criteria topic.
pub const TOPIC_PREFIX: u8 = 0x0f;

/// Size bucket upper bound for the LOW degree.
pub const SIZE_LOW_MAX: u64 = 32 * 1024 * 1024;
/// Size bucket upper bound for the MED degree. HIGH is unbounded above.
pub const SIZE_MED_MAX: u64 = 512 * 1024 * 1024;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Duration bucket upper bound for the LOW degree, in milliseconds.
pub const DURATION_LOW_MAX: u64 = 30 * DAY_MS;
/// Duration bucket upper bound for the MED degree, in milliseconds.
pub const DURATION_MED_MAX: u64 = 90 * DAY_MS;

/// One bucket on a criteria axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Degree {
    Low = 0x01,
    Med = 0x02,
    High = 0x03,
}

/// The two axes not derivable from the contract record itself. Both
/// default to MED until the publisher supplies stronger requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub availability: Degree,
    pub speed: Degree,
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria {
            availability: Degree::Med,
            speed: Degree::Med,
        }
    }
}

/// Degree bucket for a shard size in bytes.
pub fn size_degree(data_size: u64) -> Degree {
    if data_size <= SIZE_LOW_MAX {
        Degree::Low
    } else if data_size <= SIZE_MED_MAX {
        Degree::Med
    } else {
        Degree::High
    }
}

/// Degree bucket for a storage duration in milliseconds.
pub fn duration_degree(duration_ms: u64) -> Degree {
    if duration_ms <= DURATION_LOW_MAX {
        Degree::Low
    } else if duration_ms <= DURATION_MED_MAX {
        Degree::Med
    } else {
        Degree::High
    }
}
