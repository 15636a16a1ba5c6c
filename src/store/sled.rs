// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Sled-backed adapter. Items live in one tree; shard bytes are chunked
//! into a second tree under `hash/index` keys with a length marker
//! written at commit time, so a crashed transfer never surfaces as a
//! stored shard.

use super::{Error, KeyValueStore, ShardReader, ShardSink, ShardStore};
use async_trait::async_trait;
use sled::{Db, Tree};
use std::io::Cursor;
use std::path::Path;

const ITEMS_TREE: &str = "items";
const SHARDS_TREE: &str = "shards";

/// Marker key recording a committed shard's chunk count.
fn len_key(hash: &str) -> Vec<u8> {
    format!("{hash}/len").into_bytes()
}

fn chunk_key(hash: &str, index: u32) -> Vec<u8> {
    let mut key = format!("{hash}/").into_bytes();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Persistent adapter over a [sled] database.
#[derive(Debug, Clone)]
pub struct SledAdapter {
    db: Db,
    items: Tree,
    shards: Tree,
}

impl SledAdapter {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory instance that does not persist, for tests.
    pub fn temporary() -> Result<Self, Error> {
        let db = sled::Config::default().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, Error> {
        let items = db.open_tree(ITEMS_TREE)?;
        let shards = db.open_tree(SHARDS_TREE)?;
        Ok(SledAdapter { db, items, shards })
    }

    fn chunk_count(&self, hash: &str) -> Result<Option<u32>, Error> {
        let Some(bytes) = self.shards.get(len_key(hash))? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| Error::Encoding(format!("corrupt length marker for {hash}")))?;
        Ok(Some(u32::from_be_bytes(bytes)))
    }
}

impl KeyValueStore for SledAdapter {
    fn read<K>(&self, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.items.get(key)?.map(|v| v.as_ref().to_vec()))
    }

    fn write<K, V>(&self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.items.insert(key, value.as_ref())?;
        Ok(())
    }

    fn delete<K>(&self, key: K) -> Result<(), Error>
    where
        K: AsRef<[u8]>,
    {
        self.items.remove(key)?;
        Ok(())
    }

    fn exists<K>(&self, key: K) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
    {
        Ok(self.items.contains_key(key)?)
    }
}

struct SledSink {
    hash: String,
    next_index: u32,
    shards: Tree,
}

impl SledSink {
    fn remove_written(&self) -> Result<(), Error> {
        for index in 0..self.next_index {
            self.shards.remove(chunk_key(&self.hash, index))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ShardSink for SledSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.shards
            .insert(chunk_key(&self.hash, self.next_index), chunk)?;
        self.next_index += 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.shards
            .insert(len_key(&self.hash), self.next_index.to_be_bytes().to_vec())?;
        self.shards.flush_async().await?;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), Error> {
        self.remove_written()
    }
}

#[async_trait]
impl ShardStore for SledAdapter {
    async fn shard_reader(&self, hash: &str) -> Result<ShardReader, Error> {
        let count = self
            .chunk_count(hash)?
            .ok_or_else(|| Error::ShardNotFound(hash.to_owned()))?;

        let mut bytes = Vec::new();
        for index in 0..count {
            let chunk = self
                .shards
                .get(chunk_key(hash, index))?
                .ok_or_else(|| Error::Encoding(format!("missing chunk {index} of {hash}")))?;
            bytes.extend_from_slice(chunk.as_ref());
        }
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn shard_writer(&self, hash: &str) -> Result<Box<dyn ShardSink>, Error> {
        if self.chunk_count(hash)?.is_some() {
            return Err(Error::AlreadyStored(hash.to_owned()));
        }
        Ok(Box::new(SledSink {
            hash: hash.to_owned(),
            next_index: 0,
            shards: self.shards.clone(),
        }))
    }

    async fn shard_exists(&self, hash: &str) -> Result<bool, Error> {
        Ok(self.chunk_count(hash)?.is_some())
    }

    async fn delete_shard(&self, hash: &str) -> Result<(), Error> {
        let Some(count) = self.chunk_count(hash)? else {
            return Ok(());
        };
        for index in 0..count {
            self.shards.remove(chunk_key(hash, index))?;
        }
        self.shards.remove(len_key(hash))?;
        Ok(())
    }

    fn used_space(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}
