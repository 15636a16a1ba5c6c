// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::offers::MAX_OFFERS_DEFAULT;
use crate::rules::{CONSIGN_THRESHOLD_MS, MAX_CONCURRENT_AUDITS};
use crate::shard_server::TOKEN_TTL_MS;
use serde::Deserialize;

/// Deadline applied to every outbound RPC.
pub const RESPONSE_TIMEOUT_MS: u64 = 9_000;

/// How often the token reaper sweeps the table.
pub const TOKEN_REAP_INTERVAL_MS: u64 = 30_000;

/// Node tunables. Everything has a sensible default; deployments
/// override the fields they care about from their configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Offers accepted per published contract before the stream ends.
    pub max_offers: usize,
    /// Forward slack on the CONSIGN window, in milliseconds.
    pub consign_threshold_ms: u64,
    /// Transfer token lifetime, in milliseconds.
    pub token_ttl_ms: u64,
    /// Outbound RPC deadline, in milliseconds.
    pub response_timeout_ms: u64,
    /// Proofs generated concurrently per AUDIT batch.
    pub max_concurrent_audits: usize,
    /// Optional cap on shard bytes held; crossing it emits a
    /// space-pressure event.
    pub capacity_bytes: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            max_offers: MAX_OFFERS_DEFAULT,
            consign_threshold_ms: CONSIGN_THRESHOLD_MS,
            token_ttl_ms: TOKEN_TTL_MS,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            max_concurrent_audits: MAX_CONCURRENT_AUDITS,
            capacity_bytes: None,
        }
    }
}
