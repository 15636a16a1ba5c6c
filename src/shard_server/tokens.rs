// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::node::Contact;
use crate::utils::Clock;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Default transfer token lifetime.
pub const TOKEN_TTL_MS: u64 = 2 * 60 * 1000;

/// Raw token length in bytes; tokens travel as 40-hex strings.
pub const TOKEN_LEN: usize = 20;

/// Generate a fresh transfer token.
pub fn generate_token<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Transfer direction a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Push,
    Pull,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("The supplied token is not accepted")]
    UnknownToken,
    #[error("The token has expired")]
    Expired,
    #[error("The token is already in use")]
    AlreadyActive,
    #[error("The token does not authorize this shard")]
    WrongHash,
    #[error("The token does not authorize this operation")]
    WrongOperation,
}

/// One granted authorization.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub hash: String,
    pub contact: Contact,
    pub operation: Operation,
    pub expires_at: u64,
    pub active: bool,
    /// Upper bound on uploaded bytes, from the contract's `data_size`.
    pub size_limit: Option<u64>,
}

/// Single-writer table of outstanding transfer tokens. Handlers grant
/// tokens through [`TokenTable::accept`]; the HTTP endpoint consumes
/// them through [`TokenTable::authorize`].
pub struct TokenTable {
    entries: Mutex<HashMap<String, TokenEntry>>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl TokenTable {
    pub fn new(ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        TokenTable {
            entries: Mutex::new(HashMap::new()),
            ttl_ms,
            clock,
        }
    }

    /// Register a token for `contact` to transfer `hash`.
    pub fn accept(
        &self,
        token: &str,
        hash: &str,
        contact: Contact,
        operation: Operation,
        size_limit: Option<u64>,
    ) {
        let expires_at = self.clock.now_ms() + self.ttl_ms;
        trace!(token, hash, ?operation, "accepting transfer token");
        self.entries.lock().insert(
            token.to_owned(),
            TokenEntry {
                hash: hash.to_owned(),
                contact,
                operation,
                expires_at,
                active: false,
                size_limit,
            },
        );
    }

    /// Check a presented token against `hash` and `operation` and mark
    /// it active. An active token cannot be authorized a second time.
    pub fn authorize(
        &self,
        token: &str,
        hash: &str,
        operation: Operation,
    ) -> Result<TokenEntry, AccessError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(token).ok_or(AccessError::UnknownToken)?;

        if self.clock.now_ms() >= entry.expires_at {
            return Err(AccessError::Expired);
        }
        if entry.active {
            return Err(AccessError::AlreadyActive);
        }
        if entry.hash != hash {
            return Err(AccessError::WrongHash);
        }
        if entry.operation != operation {
            return Err(AccessError::WrongOperation);
        }

        entry.active = true;
        Ok(entry.clone())
    }

    /// Forget a token. Called on success and on failure alike.
    pub fn release(&self, token: &str) {
        self.entries.lock().remove(token);
    }

    /// Purge expired tokens; returns how many were dropped.
    pub fn reap(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let reaped = before - entries.len();
        if reaped > 0 {
            debug!(reaped, "reaped expired transfer tokens");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Periodically purge expired tokens until the table is dropped.
    pub fn spawn_reaper(self: Arc<Self>, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        let table = Arc::downgrade(&self);
        drop(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            loop {
                ticker.tick().await;
                match table.upgrade() {
                    Some(table) => {
                        table.reap();
                    }
                    None => break,
                }
            }
        })
    }
}
