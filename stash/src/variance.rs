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

//! Variants: picking the stored response that matches a request, and pruning the ones that can
//! no longer be picked

use crate::key::CacheKey;
use crate::meta::StoredMeta;

use blake2::Digest;
use http::header::{HeaderName, VARY};
use http::HeaderMap;
use log::{debug, info};
use stash_error::Result;
use stash_store::key::{Blake2b128, HashBinary};
use stash_store::{live_entries, CompactOpts, ContentStore, IndexEntry};
use std::collections::BTreeMap;
use url::Url;

/// What a response's `Vary` says
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vary {
    /// No `Vary`, every request matches
    None,
    /// `Vary: *`, no request matches
    Any,
    /// The request headers that have to match, lowercased and deduplicated
    Headers(Vec<HeaderName>),
}

impl Vary {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut names: Vec<HeaderName> = vec![];
        for line in headers.get_all(VARY) {
            let Ok(line) = line.to_str() else {
                debug!("ignoring non ascii Vary");
                continue;
            };
            for field in line.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                if field == "*" {
                    return Vary::Any;
                }
                // HeaderName parsing lowercases
                match HeaderName::from_bytes(field.as_bytes()) {
                    Ok(name) if !names.contains(&name) => names.push(name),
                    Ok(_) => {}
                    Err(_) => debug!("ignoring bad Vary field {field}"),
                }
            }
        }
        if names.is_empty() {
            Vary::None
        } else {
            Vary::Headers(names)
        }
    }
}

/// The header names a response varies on, `None` without `Vary` or with `Vary: *`
pub fn vary_header_names(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    match Vary::from_headers(headers) {
        Vary::Headers(names) => Some(names),
        _ => None,
    }
}

/// Hash of the values `req` has for `names`. Not sensitive to the order of `names`.
///
/// Two requests with the same signature over a response's `Vary` names are served the same
/// variant. A missing header hashes differently from an empty one.
pub fn vary_signature(names: &[HeaderName], req: &HeaderMap) -> HashBinary {
    const SALT: &[u8; 1] = &[0u8; 1];
    const ABSENT: &[u8; 1] = &[1u8; 1];
    let values: BTreeMap<&str, Vec<&[u8]>> = names
        .iter()
        .map(|name| {
            let values = req.get_all(name).iter().map(|v| v.as_bytes()).collect();
            (name.as_str(), values)
        })
        .collect();

    let mut hash = Blake2b128::new();
    for (name, values) in values.iter() {
        hash.update(name.as_bytes());
        hash.update(SALT);
        if values.is_empty() {
            hash.update(ABSENT);
        }
        for value in values {
            hash.update(value);
            hash.update(SALT);
        }
        hash.update(SALT);
    }
    hash.finalize().into()
}

/// Whether the stored variant described by `meta` may answer a request with `req` headers
///
/// Every header named by the stored `Vary` has to carry exactly the values recorded at write
/// time, absence matching absence.
pub fn variant_matches(meta: &StoredMeta, req: &HeaderMap) -> bool {
    match Vary::from_headers(&meta.res_headers) {
        Vary::None => true,
        Vary::Any => false,
        Vary::Headers(names) => {
            vary_signature(&names, &meta.req_headers) == vary_signature(&names, req)
        }
    }
}

/// A row picked by [select], with its decoded metadata
#[derive(Debug, Clone)]
pub struct Selected<'a> {
    pub entry: &'a IndexEntry,
    pub meta: StoredMeta,
}

/// The newest live row under a key that may answer a request with `req` headers
///
/// `entries` are in write order. Rows behind a deletion marker and rows whose metadata cannot be
/// decoded are never picked.
pub fn select<'a>(entries: &'a [IndexEntry], req: &HeaderMap) -> Option<Selected<'a>> {
    live_entries(entries).iter().rev().find_map(|entry| {
        let meta = StoredMeta::from_entry(entry)
            .map_err(|e| debug!("skipping unreadable row of {}: {e}", entry.key))
            .ok()?;
        variant_matches(&meta, req).then_some(Selected { entry, meta })
    })
}

// whether `newer` would be picked for every request `older` was written for
fn supersedes(newer: &IndexEntry, older: &IndexEntry) -> bool {
    let (Ok(newer), Ok(older)) = (StoredMeta::from_entry(newer), StoredMeta::from_entry(older))
    else {
        return false;
    };
    variant_matches(&newer, &older.req_headers)
}

/// Prunes the index of a key
///
/// Keeps the newest row of each variant, drops `Vary: *` rows, rows with unreadable (legacy)
/// metadata and redirect tombstones whose target has nothing cached anymore.
pub struct IndexCompactor<'a> {
    store: &'a dyn ContentStore,
}

impl<'a> IndexCompactor<'a> {
    pub fn new(store: &'a dyn ContentStore) -> Self {
        IndexCompactor { store }
    }

    // a redirect tombstone is worth keeping while its target has something to serve
    async fn target_alive(&self, entry: &IndexEntry) -> Result<bool> {
        let Ok(meta) = StoredMeta::from_entry(entry) else {
            return Ok(false);
        };
        let target = Url::parse(&meta.url)
            .ok()
            .and_then(|base| base.join(meta.location()?).ok());
        let Some(target) = target else {
            return Ok(false);
        };
        let rows = self
            .store
            .index_query(CacheKey::for_url(&target).as_str())
            .await?;
        Ok(!live_entries(&rows).is_empty())
    }

    /// Compact the rows of `key`, return the rows kept
    pub async fn compact(&self, key: &CacheKey) -> Result<Vec<IndexEntry>> {
        let rows = self.store.index_query(key.as_str()).await?;
        let mut dead_tombstones = vec![];
        for entry in live_entries(&rows).iter().filter(|e| e.is_tombstone()) {
            if !self.target_alive(entry).await? {
                dead_tombstones.push(entry.clone());
            }
        }

        let validate = |entry: &IndexEntry| {
            let Ok(meta) = StoredMeta::from_entry(entry) else {
                return false;
            };
            if Vary::from_headers(&meta.res_headers) == Vary::Any {
                return false;
            }
            !(entry.is_tombstone() && dead_tombstones.contains(entry))
        };
        let opts = CompactOpts {
            matches: &supersedes,
            validate: Some(&validate),
        };
        let kept = self.store.index_compact(key.as_str(), &opts).await?;
        info!(
            "compacted {key}: {} rows before, {} kept",
            rows.len(),
            kept.len()
        );
        Ok(kept)
    }
}
