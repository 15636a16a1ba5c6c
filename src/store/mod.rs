// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-shard state and the storage adapter seam. A [`StorageItem`]
//! aggregates everything a node knows about one shard (contracts, audit
//! trees, private challenges, per-peer metadata) and round-trips through
//! an opaque key-value adapter; shard bytes live in a separate blob
//! store reached through the same adapter.

mod memory;
#[cfg(feature = "sled")]
pub mod sled;

pub use memory::MemoryAdapter;

use crate::audit::AuditRecord;
use crate::contract::Contract;
use crate::node::Contact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Storage error
#[derive(Debug, Error)]
pub enum Error {
    #[error("No storage item found for key: {0}")]
    NotFound(String),
    #[error("No shard stored for hash: {0}")]
    ShardNotFound(String),
    #[error("Shard already stored for hash: {0}")]
    AlreadyStored(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[cfg(feature = "sled")]
    #[error(transparent)]
    Database(#[from] ::sled::Error),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

/// Key-value side of a storage adapter.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key does not exist.
    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>;

    /// Write a single value.
    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>;

    /// Delete a key; deleting a missing key is not an error.
    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>;

    /// Returns `Ok(true)` if the key exists.
    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.read(key)?.is_some())
    }
}

/// Byte source for a stored shard.
pub type ShardReader = Box<dyn AsyncRead + Send + Unpin>;

/// Incremental writer for an incoming shard. Nothing is visible to
/// readers until [`ShardSink::commit`]; a dropped or aborted sink leaves
/// no partial shard behind.
#[async_trait]
pub trait ShardSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error>;
    async fn commit(self: Box<Self>) -> Result<(), Error>;
    async fn abort(self: Box<Self>) -> Result<(), Error>;
}

/// Blob side of a storage adapter.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Open a byte stream over a stored shard.
    async fn shard_reader(&self, hash: &str) -> Result<ShardReader, Error>;

    /// Open a writer for a new shard. Fails with
    /// [`Error::AlreadyStored`] when the shard is present.
    async fn shard_writer(&self, hash: &str) -> Result<Box<dyn ShardSink>, Error>;

    async fn shard_exists(&self, hash: &str) -> Result<bool, Error>;

    async fn delete_shard(&self, hash: &str) -> Result<(), Error>;

    /// Bytes currently held by the blob store.
    fn used_space(&self) -> u64;
}

/// Full adapter: both sides together. Implemented for anything that
/// implements both traits.
pub trait StorageAdapter: KeyValueStore + ShardStore {}
impl<T: KeyValueStore + ShardStore> StorageAdapter for T {}

/// Everything a node tracks for one shard, keyed by `data_hash`. A
/// single shard may carry concurrent contracts with several peers, so
/// every map is keyed per peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageItem {
    pub hash: String,
    #[serde(default)]
    pub contracts: BTreeMap<String, Contract>,
    #[serde(default)]
    pub trees: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub challenges: BTreeMap<String, AuditRecord>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

impl StorageItem {
    pub fn new(hash: &str) -> Self {
        StorageItem {
            hash: hash.to_owned(),
            ..Default::default()
        }
    }

    /// Contracts are keyed by the counterparty's extended key when it
    /// has one (so a renewal under a rotated leaf key still finds the
    /// agreement), falling back to the node id.
    pub fn contract_key(contact: &Contact) -> String {
        contact
            .hd_key
            .clone()
            .unwrap_or_else(|| contact.id.clone())
    }

    pub fn contract(&self, contact: &Contact) -> Option<&Contract> {
        self.contracts.get(&Self::contract_key(contact))
    }

    pub fn add_contract(&mut self, contact: &Contact, contract: Contract) {
        self.trees
            .insert(Self::contract_key(contact), contract.audit_leaves.clone());
        self.contracts
            .insert(Self::contract_key(contact), contract);
    }

    pub fn remove_contract(&mut self, contact: &Contact) {
        let key = Self::contract_key(contact);
        self.contracts.remove(&key);
        self.trees.remove(&key);
        self.challenges.remove(&key);
    }

    /// Record the private audit state for a counterparty.
    pub fn add_audit_record(&mut self, contact: &Contact, record: AuditRecord) {
        self.challenges.insert(Self::contract_key(contact), record);
    }

    pub fn audit_record(&self, contact: &Contact) -> Option<&AuditRecord> {
        self.challenges.get(&Self::contract_key(contact))
    }

    /// The audit leaves held for a counterparty, used to answer
    /// challenges.
    pub fn audit_leaves(&self, contact: &Contact) -> Option<&Vec<String>> {
        self.trees.get(&Self::contract_key(contact))
    }
}

/// Capacity and pressure notifications emitted by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// The blob store crossed the configured capacity.
    SpaceLow { used: u64, capacity: u64 },
}

/// Save/load/delete [`StorageItem`]s over an adapter, serializing
/// mutations per `data_hash` key.
pub struct StorageManager<DB> {
    db: DB,
    capacity: Option<u64>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl<DB: StorageAdapter> StorageManager<DB> {
    pub fn new(db: DB) -> Self {
        Self::with_capacity(db, None)
    }

    pub fn with_capacity(db: DB, capacity: Option<u64>) -> Self {
        let (events, _) = broadcast::channel(16);
        StorageManager {
            db,
            capacity,
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn load(&self, hash: &str) -> Result<StorageItem, Error> {
        let bytes = self
            .db
            .read(hash.as_bytes())?
            .ok_or_else(|| Error::NotFound(hash.to_owned()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, item: &StorageItem) -> Result<(), Error> {
        let bytes = serde_json::to_vec(item)?;
        self.db.write(item.hash.as_bytes(), bytes)
    }

    pub fn exists(&self, hash: &str) -> Result<bool, Error> {
        self.db.exists(hash.as_bytes())
    }

    /// Transactional update for one `data_hash`: loads (or creates) the
    /// item, applies `apply`, and saves, holding the per-key lock for
    /// the whole round trip. Mutations on distinct hashes proceed
    /// independently.
    pub async fn put<F>(&self, hash: &str, apply: F) -> Result<StorageItem, Error>
    where
        F: FnOnce(&mut StorageItem),
    {
        let lock = self.key_lock(hash).await;
        let _guard = lock.lock().await;

        let mut item = match self.load(hash) {
            Ok(item) => item,
            Err(Error::NotFound(_)) => StorageItem::new(hash),
            Err(e) => return Err(e),
        };
        apply(&mut item);
        self.save(&item)?;
        Ok(item)
    }

    /// Remove the item and its shard bytes.
    pub async fn delete(&self, hash: &str) -> Result<(), Error> {
        let lock = self.key_lock(hash).await;
        let _guard = lock.lock().await;

        self.db.delete(hash.as_bytes())?;
        self.db.delete_shard(hash).await
    }

    pub async fn shard_reader(&self, hash: &str) -> Result<ShardReader, Error> {
        self.db.shard_reader(hash).await
    }

    pub async fn shard_writer(&self, hash: &str) -> Result<Box<dyn ShardSink>, Error> {
        self.db.shard_writer(hash).await
    }

    pub async fn shard_exists(&self, hash: &str) -> Result<bool, Error> {
        self.db.shard_exists(hash).await
    }

    /// Emit a pressure event when the blob store has crossed the
    /// configured capacity. Called after commits; cheap enough to call
    /// unconditionally.
    pub fn check_capacity(&self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        let used = self.db.used_space();
        if used >= capacity {
            warn!(used, capacity, "shard store is over capacity");
            let _ = self.events.send(StorageEvent::SpaceLow { used, capacity });
        }
    }

    async fn key_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(hash.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
