// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{Error, KeyValueStore, ShardReader, ShardSink, ShardStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

/// A thread-safe in-memory adapter: `HashMap`s behind locks for both the
/// item store and the shard blobs. Used for tests and short-lived
/// embedded nodes.
#[derive(Debug, Default, Clone)]
pub struct MemoryAdapter {
    items: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
    shards: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl KeyValueStore for MemoryAdapter {
    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.items.read().get(key.as_ref()).cloned())
    }

    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.items
            .write()
            .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        Ok(())
    }

    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
    {
        self.items.write().remove(key.as_ref());
        Ok(())
    }

    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.items.read().contains_key(key.as_ref()))
    }
}

struct MemorySink {
    hash: String,
    buffer: Vec<u8>,
    shards: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl ShardSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.shards.write().insert(self.hash, self.buffer);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl ShardStore for MemoryAdapter {
    async fn shard_reader(&self, hash: &str) -> Result<ShardReader, Error> {
        let bytes = self
            .shards
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(hash.to_owned()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn shard_writer(&self, hash: &str) -> Result<Box<dyn ShardSink>, Error> {
        if self.shards.read().contains_key(hash) {
            return Err(Error::AlreadyStored(hash.to_owned()));
        }
        Ok(Box::new(MemorySink {
            hash: hash.to_owned(),
            buffer: Vec::new(),
            shards: self.shards.clone(),
        }))
    }

    async fn shard_exists(&self, hash: &str) -> Result<bool, Error> {
        Ok(self.shards.read().contains_key(hash))
    }

    async fn delete_shard(&self, hash: &str) -> Result<(), Error> {
        self.shards.write().remove(hash);
        Ok(())
    }

    fn used_space(&self) -> u64 {
        self.shards.read().values().map(|v| v.len() as u64).sum()
    }
}
