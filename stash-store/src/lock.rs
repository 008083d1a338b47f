// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per key write locks
//!
//! Whoever changes the rows of a key takes the key's lock first: appends as well as compaction,
//! which reads the rows and writes back a subset. Unrelated keys never contend on it beyond the
//! shard's table lock.

use crate::key::hash_key;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A hash table that shards to a constant number of tables to reduce lock contention
struct ShardedTable<V, const N: usize> {
    tables: [RwLock<HashMap<u128, V>>; N],
}

impl<V, const N: usize> ShardedTable<V, N>
where
    [RwLock<HashMap<u128, V>>; N]: Default,
{
    fn new() -> Self {
        ShardedTable {
            tables: Default::default(),
        }
    }

    fn get(&self, key: u128) -> &RwLock<HashMap<u128, V>> {
        &self.tables[(key % N as u128) as usize]
    }
}

const N_SHARDS: usize = 16;

/// The lock table. Holding the returned guard grants exclusive rewrite access to one key.
pub struct KeyLocks {
    table: ShardedTable<Arc<Mutex<()>>, N_SHARDS>,
}

impl KeyLocks {
    pub fn new() -> Self {
        KeyLocks {
            table: ShardedTable::new(),
        }
    }

    /// Wait for and take the lock of `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let hash = u128::from_be_bytes(hash_key(key)); // endianness doesn't matter
        let shard = self.table.get(hash);
        let existing = shard.read().get(&hash).cloned();
        let mutex = match existing {
            Some(m) => m,
            None => {
                let mut table = shard.write();
                // drop locks nobody holds or waits on
                table.retain(|_, m| Arc::strong_count(m) > 1);
                table.entry(hash).or_default().clone()
            }
        };
        mutex.lock_owned().await
    }

    /// Number of keys currently tracked, for tests
    pub fn tracked(&self) -> usize {
        self.table.tables.iter().map(|t| t.read().len()).sum()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}
