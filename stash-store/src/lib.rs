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

//! Content-addressed body storage with an append-only metadata index
//!
//! Bodies are stored under their [Integrity] and can only be read back through a reader that
//! verifies them. Keys map to an append-only list of [IndexEntry] rows that point at those bodies.

#![allow(clippy::new_without_default)]

use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use stash_error::Result;

pub mod disk;
pub mod index;
pub mod integrity;
pub mod key;
pub mod lock;
pub mod memory;

pub use disk::DiskStore;
pub use index::{compact_entries, live_entries, CompactOpts, IndexEntry};
pub use integrity::{Algorithm, Integrity, IntegrityChecker, IntegrityHasher};
pub use memory::MemStore;

/// Options of a content write
#[derive(Debug, Clone, Default)]
pub struct PutOpts {
    /// Algorithms to compute, sha512 if empty
    pub algorithms: Vec<Algorithm>,
    /// Caller metadata to record in the index row
    pub metadata: Vec<u8>,
    /// When set, the write only commits if the content matches it
    pub integrity: Option<Integrity>,
    /// When set, the write only commits if exactly this many bytes were written
    pub size: Option<u64>,
}

impl PutOpts {
    /// What a write hashes with: the requested algorithms, plus the one `integrity` is checked in
    pub fn hash_algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms = if self.algorithms.is_empty() {
            vec![Algorithm::default()]
        } else {
            self.algorithms.clone()
        };
        if let Some(expected) = self.integrity.as_ref() {
            algorithms.push(expected.strongest().algorithm);
        }
        algorithms
    }
}

/// The outcome of a committed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Written {
    pub integrity: Integrity,
    pub size: u64,
}

/// Reading stored content
#[async_trait]
pub trait HandleRead {
    /// Read the next chunk of content
    ///
    /// Return `None` when no more body to read. Content that fails its integrity check errors
    /// with `EINTEGRITY` at the end instead of returning `None`.
    async fn read_body(&mut self) -> Result<Option<Bytes>>;
}

/// Content reader
pub type ContentReader = Box<dyn HandleRead + Send + Sync>;

/// Writing new content
#[async_trait]
pub trait HandleWrite {
    /// Append to the content being written
    async fn write_body(&mut self, data: Bytes) -> Result<()>;

    /// Commit the content and append its index row
    ///
    /// When `self` is dropped without calling this function, nothing is committed and any
    /// partially written content is discarded.
    async fn finish(self: Box<Self>) -> Result<Written>;
}

/// Content writer
pub type ContentWriter = Box<dyn HandleWrite + Send + Sync>;

/// Content store interface
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Where the data lives, e.g. the cache directory
    fn location(&self) -> &str;

    /// Store `data` under `key` in one go
    async fn put(&self, key: &str, data: Bytes, opts: PutOpts) -> Result<Written> {
        let mut writer = self.put_stream(key, opts).await?;
        writer.write_body(data).await?;
        writer.finish().await
    }

    /// Start writing content for `key`. See [HandleWrite].
    async fn put_stream(&self, key: &str, opts: PutOpts) -> Result<ContentWriter>;

    /// Read the content with the given integrity
    ///
    /// Missing content fails with `ENOENT`. Corrupt content fails with `EINTEGRITY` while reading.
    async fn get_stream(&self, integrity: &Integrity) -> Result<ContentReader>;

    /// Whether content with the given integrity is present
    async fn has_content(&self, integrity: &Integrity) -> Result<bool>;

    /// Delete content. Index rows pointing at it are left alone.
    async fn remove_content(&self, integrity: &Integrity) -> Result<bool>;

    /// Append a row to the index of `entry.key`
    async fn index_insert(&self, entry: IndexEntry) -> Result<()>;

    /// All rows of `key` in write order, deletion markers included
    async fn index_query(&self, key: &str) -> Result<Vec<IndexEntry>>;

    /// Rewrite the rows of `key` per [compact_entries], return the rows kept.
    ///
    /// Compactions of the same key are serialized. The rewrite is skipped when a surviving row
    /// points at content that is not present, so rows are never dropped in favor of a row that
    /// cannot be served.
    async fn index_compact(&self, key: &str, opts: &CompactOpts<'_>) -> Result<Vec<IndexEntry>>;
}

/// Compute the rows to keep, or `None` when a surviving row lost its content.
async fn plan_compaction<S: ContentStore + ?Sized>(
    store: &S,
    entries: &[IndexEntry],
    opts: &CompactOpts<'_>,
) -> Result<Option<Vec<IndexEntry>>> {
    let kept = compact_entries(entries, opts);
    for entry in kept.iter() {
        if let Some(integrity) = entry.integrity.as_ref() {
            if !store.has_content(integrity).await? {
                warn!(
                    "not compacting {}: content {} of a surviving row is missing",
                    entry.key,
                    integrity.strongest()
                );
                return Ok(None);
            }
        }
    }
    Ok(Some(kept))
}

/// Wraps a raw content reader and verifies the content at the end
struct VerifiedReader<R> {
    inner: R,
    checker: Option<IntegrityChecker>,
}

impl<R> VerifiedReader<R> {
    fn new(inner: R, expected: Integrity) -> Self {
        VerifiedReader {
            inner,
            checker: Some(IntegrityChecker::new(expected)),
        }
    }
}

#[async_trait]
impl<R: HandleRead + Send + Sync> HandleRead for VerifiedReader<R> {
    async fn read_body(&mut self) -> Result<Option<Bytes>> {
        match self.inner.read_body().await? {
            Some(data) => {
                if let Some(checker) = self.checker.as_mut() {
                    checker.update(&data);
                }
                Ok(Some(data))
            }
            None => {
                if let Some(checker) = self.checker.take() {
                    checker.finish().map_err(|e| e.into_store())?;
                }
                Ok(None)
            }
        }
    }
}
