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

//! The cache side of a fetch: finding, reading, writing and invalidating stored responses

use crate::conf::CacheConf;
use crate::key::CacheKey;
use crate::meta::StoredMeta;
use crate::pipeline::{Body, PipelineMode};
use crate::policy::{CachePolicy, PolicyConf, RequestParts, StoredResponse};
use crate::transport::{BodyStream, Request};
use crate::variance::{select, IndexCompactor};

use log::{debug, info, warn};
use stash_error::Result;
use stash_store::{ContentStore, IndexEntry, Integrity, PutOpts};
use std::sync::Arc;
use std::time::SystemTime;

/// A stored response picked for a request
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub key: CacheKey,
    pub entry: IndexEntry,
    pub meta: StoredMeta,
}

impl CachedResponse {
    /// The policy of this response for `req` at `now`
    pub fn policy(&self, req: &Request, now: SystemTime, conf: &PolicyConf) -> CachePolicy {
        CachePolicy::new(
            &RequestParts {
                method: &req.method,
                headers: &req.headers,
            },
            &StoredResponse {
                status: self.meta.status,
                headers: &self.meta.res_headers,
                response_time: self.entry.write_time(),
            },
            now,
            conf,
        )
    }

    /// Whether this is a redirect stored without a body
    pub fn is_tombstone(&self) -> bool {
        self.entry.is_tombstone()
    }

    pub fn integrity(&self) -> Option<&Integrity> {
        self.entry.integrity.as_ref()
    }
}

/// Cache operations over a [ContentStore]
#[derive(Clone)]
pub struct CacheEngine {
    store: Arc<dyn ContentStore>,
    policy: PolicyConf,
    buffer_threshold: u64,
}

impl CacheEngine {
    pub fn new(store: Arc<dyn ContentStore>, conf: &CacheConf) -> Self {
        CacheEngine {
            store,
            policy: conf.policy_conf(),
            buffer_threshold: conf.buffer_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Where the store keeps its data
    pub fn location(&self) -> &str {
        self.store.location()
    }

    pub fn policy_conf(&self) -> &PolicyConf {
        &self.policy
    }

    /// The stored response that may answer `req`
    ///
    /// A store that cannot be queried is a miss. With `expected`, a stored body whose integrity
    /// does not match it is a miss too.
    pub async fn lookup(
        &self,
        key: &CacheKey,
        req: &Request,
        expected: Option<&Integrity>,
    ) -> Option<CachedResponse> {
        let rows = match self.store.index_query(key.as_str()).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("failed to query the index of {key}, treating as a miss: {e}");
                return None;
            }
        };
        let Some(selected) = select(&rows, &req.headers) else {
            debug!("no variant of {key} for this request ({} rows)", rows.len());
            return None;
        };
        if let (Some(expected), Some(integrity)) = (expected, selected.entry.integrity.as_ref()) {
            if integrity.matches(expected).is_none() {
                debug!("stored body of {key} is not {expected}, ignoring it");
                return None;
            }
        }
        Some(CachedResponse {
            key: key.clone(),
            entry: selected.entry.clone(),
            meta: selected.meta,
        })
    }

    /// The body of a stored response
    pub fn replay(&self, cached: &CachedResponse) -> Body {
        match cached.integrity() {
            Some(integrity) => Body::replay(
                self.store.clone(),
                cached.key.clone(),
                integrity.clone(),
                PipelineMode::choose(Some(cached.entry.size), self.buffer_threshold),
            ),
            None => Body::empty(),
        }
    }

    /// A network body that is written under `key` as it is read
    ///
    /// With `expected`, nothing is written unless the body matches it.
    pub fn tee(
        &self,
        key: &CacheKey,
        meta: &StoredMeta,
        body: BodyStream,
        content_length: Option<u64>,
        expected: Option<Integrity>,
    ) -> Result<Body> {
        let opts = PutOpts {
            algorithms: meta.options.algorithms.clone(),
            metadata: meta.serialize()?,
            integrity: expected,
            size: None,
        };
        let mode = PipelineMode::choose(content_length, self.buffer_threshold);
        debug!("caching {key} in {} mode", mode.as_str());
        Ok(Body::tee(body, self.store.clone(), key.clone(), opts, mode))
    }

    /// Store a redirect: metadata only, the body is not kept
    pub async fn store_redirect(&self, key: &CacheKey, meta: &StoredMeta) -> Result<()> {
        debug!(
            "caching redirect {key} -> {}",
            meta.location().unwrap_or_default()
        );
        self.store
            .index_insert(IndexEntry::tombstone(key.as_str(), meta.serialize()?))
            .await
    }

    /// Record new metadata for an already stored body, after a successful revalidation
    pub async fn refresh(&self, cached: &CachedResponse, meta: &StoredMeta) -> Result<IndexEntry> {
        let metadata = meta.serialize()?;
        let entry = match cached.integrity() {
            Some(integrity) => IndexEntry::content(
                cached.key.as_str(),
                integrity.clone(),
                cached.entry.size,
                metadata,
            ),
            None => IndexEntry::tombstone(cached.key.as_str(), metadata),
        };
        self.store.index_insert(entry.clone()).await?;
        debug!("refreshed {}", cached.key);
        Ok(entry)
    }

    /// Void everything stored under `key`
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        info!("invalidating {key}");
        self.store
            .index_insert(IndexEntry::deletion(key.as_str()))
            .await
    }

    /// Prune the index of `key`, return the rows kept
    pub async fn compact(&self, key: &CacheKey) -> Result<Vec<IndexEntry>> {
        IndexCompactor::new(self.store.as_ref()).compact(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaOptions;
    use crate::transport::chunked_body;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use stash_store::MemStore;

    fn engine() -> CacheEngine {
        CacheEngine::new(Arc::new(MemStore::new()), &CacheConf::default())
    }

    fn stored_meta(req: &Request, res_headers: &HeaderMap) -> StoredMeta {
        StoredMeta::new(
            &req.url,
            &req.headers,
            StatusCode::OK,
            res_headers,
            MetaOptions::default(),
            &[],
        )
    }

    #[tokio::test]
    async fn test_store_lookup_replay() {
        let engine = engine();
        let req = Request::get("https://registry.test/pkg").unwrap();
        let key = CacheKey::for_url(&req.url);
        assert!(engine.lookup(&key, &req, None).await.is_none());

        let mut res_headers = HeaderMap::new();
        res_headers.insert("cache-control", HeaderValue::from_static("max-age=300"));
        let meta = stored_meta(&req, &res_headers);
        let mut body = engine
            .tee(
                &key,
                &meta,
                chunked_body(vec![Bytes::from_static(b"hello")]),
                Some(5),
                None,
            )
            .unwrap();
        assert_eq!(body.mode(), Some(PipelineMode::Buffer));
        assert_eq!(body.bytes().await.unwrap(), "hello");

        let cached = engine.lookup(&key, &req, None).await.unwrap();
        assert_eq!(cached.meta.status, StatusCode::OK);
        assert_eq!(cached.entry.size, 5);
        let policy = cached.policy(&req, SystemTime::now(), engine.policy_conf());
        assert!(policy.fresh());
        assert_eq!(engine.replay(&cached).bytes().await.unwrap(), "hello");

        // an expected integrity the stored body does not have hides it
        let other = Integrity::from_bytes(b"other", &[]);
        assert!(engine.lookup(&key, &req, Some(&other)).await.is_none());
        let same = Integrity::from_bytes(b"hello", &[]);
        assert!(engine.lookup(&key, &req, Some(&same)).await.is_some());

        engine.invalidate(&key).await.unwrap();
        assert!(engine.lookup(&key, &req, None).await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_and_redirect() {
        let engine = engine();
        let req = Request::get("https://registry.test/old").unwrap();
        let key = CacheKey::for_url(&req.url);

        let mut res_headers = HeaderMap::new();
        res_headers.insert("location", HeaderValue::from_static("/new"));
        let meta = StoredMeta {
            status: StatusCode::MOVED_PERMANENTLY,
            ..stored_meta(&req, &res_headers)
        };
        engine.store_redirect(&key, &meta).await.unwrap();
        let cached = engine.lookup(&key, &req, None).await.unwrap();
        assert!(cached.is_tombstone());
        assert_eq!(cached.meta.location(), Some("/new"));
        assert!(engine.replay(&cached).bytes().await.unwrap().is_empty());

        let mut refreshed = cached.meta.clone();
        refreshed
            .res_headers
            .insert("etag", HeaderValue::from_static("\"x\""));
        let entry = engine.refresh(&cached, &refreshed).await.unwrap();
        assert!(entry.is_tombstone());
        let cached = engine.lookup(&key, &req, None).await.unwrap();
        assert_eq!(cached.meta.res_headers["etag"], "\"x\"");
        assert_eq!(engine.store().index_query(key.as_str()).await.unwrap().len(), 2);

        // the redirect target has nothing stored, compaction drops both rows
        assert!(engine.compact(&key).await.unwrap().is_empty());
    }
}
