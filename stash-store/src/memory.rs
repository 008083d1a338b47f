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

//! Hash map based in memory store
//!
//! Mostly for testing. Nothing survives the process.

use super::*;
use crate::lock::KeyLocks;

use parking_lot::RwLock;
use stash_error::{Error, ErrorType::*};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ContentMap = Arc<RwLock<HashMap<String, Bytes>>>;
type IndexMap = Arc<RwLock<HashMap<String, Vec<IndexEntry>>>>;

/// Hash map based in memory store
pub struct MemStore {
    // one entry per hash string of the content's integrity
    content: ContentMap,
    index: IndexMap,
    // writer id -> key, writes not yet committed
    temp: Arc<RwLock<HashMap<u64, String>>>,
    last_temp_id: AtomicU64,
    locks: KeyLocks,
}

impl MemStore {
    /// Create a new [MemStore]
    pub fn new() -> Self {
        MemStore {
            content: Arc::new(RwLock::new(HashMap::new())),
            index: Arc::new(RwLock::new(HashMap::new())),
            temp: Arc::new(RwLock::new(HashMap::new())),
            last_temp_id: AtomicU64::new(0),
            locks: KeyLocks::new(),
        }
    }

    /// Number of writes started but neither committed nor dropped
    pub fn in_flight(&self) -> usize {
        self.temp.read().len()
    }

    /// Replace the bytes stored for `integrity` without updating anything else.
    ///
    /// Simulates on-disk corruption in tests.
    pub fn overwrite_content(&self, integrity: &Integrity, data: Bytes) {
        let mut content = self.content.write();
        for hash in integrity.hashes() {
            content.insert(hash.to_string(), data.clone());
        }
    }

    fn find_content(&self, integrity: &Integrity) -> Option<Bytes> {
        let content = self.content.read();
        integrity
            .hashes()
            .iter()
            .find_map(|h| content.get(&h.to_string()).cloned())
    }
}

struct MemReader {
    body: Option<Bytes>,
}

#[async_trait]
impl HandleRead for MemReader {
    async fn read_body(&mut self) -> Result<Option<Bytes>> {
        Ok(self.body.take())
    }
}

struct MemWriter {
    key: String,
    opts: PutOpts,
    hasher: IntegrityHasher,
    body: Vec<u8>,
    temp_id: u64,
    temp: Arc<RwLock<HashMap<u64, String>>>,
    content: ContentMap,
    index: IndexMap,
}

#[async_trait]
impl HandleWrite for MemWriter {
    async fn write_body(&mut self, data: Bytes) -> Result<()> {
        self.hasher.update(&data);
        self.body.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<Written> {
        let hasher = std::mem::replace(&mut self.hasher, IntegrityHasher::new(&[]));
        let (integrity, size) = hasher.finish();
        if let Some(expected) = self.opts.integrity.as_ref() {
            if integrity.matches(expected).is_none() {
                return Error::e_explain(
                    IntegrityError,
                    format!("wanted {expected} but got {integrity}"),
                )
                .map_err(|e| e.into_store());
            }
        }
        if let Some(expected) = self.opts.size {
            if expected != size {
                return Error::e_explain(
                    IntegrityError,
                    format!("wanted {expected} bytes but got {size}"),
                )
                .map_err(|e| e.into_store());
            }
        }

        let body = Bytes::from(std::mem::take(&mut self.body));
        {
            let mut content = self.content.write();
            for hash in integrity.hashes() {
                content.insert(hash.to_string(), body.clone());
            }
        }
        let entry = IndexEntry::content(
            &self.key,
            integrity.clone(),
            size,
            std::mem::take(&mut self.opts.metadata),
        );
        self.index
            .write()
            .entry(self.key.clone())
            .or_default()
            .push(entry);
        self.temp.write().remove(&self.temp_id);
        Ok(Written { integrity, size })
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        // no-op if finish() already committed
        self.temp.write().remove(&self.temp_id);
    }
}

#[async_trait]
impl ContentStore for MemStore {
    fn location(&self) -> &str {
        "memory"
    }

    async fn put_stream(&self, key: &str, opts: PutOpts) -> Result<ContentWriter> {
        let temp_id = self.last_temp_id.fetch_add(1, Ordering::Relaxed);
        self.temp.write().insert(temp_id, key.to_string());
        Ok(Box::new(MemWriter {
            key: key.to_string(),
            hasher: IntegrityHasher::new(&opts.hash_algorithms()),
            opts,
            body: vec![],
            temp_id,
            temp: self.temp.clone(),
            content: self.content.clone(),
            index: self.index.clone(),
        }))
    }

    async fn get_stream(&self, integrity: &Integrity) -> Result<ContentReader> {
        let Some(body) = self.find_content(integrity) else {
            return Error::e_explain(NotFound, format!("no content for {}", integrity.strongest()))
                .map_err(|e| e.into_store());
        };
        let reader = MemReader { body: Some(body) };
        Ok(Box::new(VerifiedReader::new(reader, integrity.clone())))
    }

    async fn has_content(&self, integrity: &Integrity) -> Result<bool> {
        Ok(self.find_content(integrity).is_some())
    }

    async fn remove_content(&self, integrity: &Integrity) -> Result<bool> {
        let mut content = self.content.write();
        let mut removed = false;
        for hash in integrity.hashes() {
            removed |= content.remove(&hash.to_string()).is_some();
        }
        Ok(removed)
    }

    async fn index_insert(&self, entry: IndexEntry) -> Result<()> {
        self.index
            .write()
            .entry(entry.key.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn index_query(&self, key: &str) -> Result<Vec<IndexEntry>> {
        Ok(self.index.read().get(key).cloned().unwrap_or_default())
    }

    async fn index_compact(&self, key: &str, opts: &CompactOpts<'_>) -> Result<Vec<IndexEntry>> {
        let _guard = self.locks.lock(key).await;
        let entries = self.index_query(key).await?;
        let Some(kept) = plan_compaction(self, &entries, opts).await? else {
            return Ok(entries);
        };
        let mut index = self.index.write();
        // rows appended while we were planning are newer than anything we looked at: keep them
        let appended: Vec<IndexEntry> = index
            .get(key)
            .map(|rows| rows.iter().skip(entries.len()).cloned().collect())
            .unwrap_or_default();
        let mut rows = kept.clone();
        rows.extend(appended);
        if rows.is_empty() {
            index.remove(key);
        } else {
            index.insert(key.to_string(), rows);
        }
        Ok(kept)
    }
}
