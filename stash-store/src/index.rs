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

//! The append-only index
//!
//! Every write to a key appends one [IndexEntry]. Nothing is edited in place: replacing content
//! appends a newer entry and deleting appends a deletion marker. [compact_entries] is the only
//! place where rows disappear.

use crate::integrity::Integrity;
use crate::key::Blake2b128;

use blake2::Digest;
use log::warn;
use serde::{Deserialize, Serialize};
use stash_error::{ErrorType::*, OrErr, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One row of the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    /// `None` for rows without a body: redirect tombstones and deletion markers
    pub integrity: Option<Integrity>,
    /// write time, milliseconds since the unix epoch
    pub time: u64,
    pub size: u64,
    /// opaque caller metadata, `None` only on deletion markers
    pub metadata: Option<Vec<u8>>,
}

pub(crate) fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl IndexEntry {
    /// A row pointing at stored content
    pub fn content(key: &str, integrity: Integrity, size: u64, metadata: Vec<u8>) -> Self {
        IndexEntry {
            key: key.to_string(),
            integrity: Some(integrity),
            time: epoch_ms(SystemTime::now()),
            size,
            metadata: Some(metadata),
        }
    }

    /// A row that has metadata but no body, e.g. a cached redirect
    pub fn tombstone(key: &str, metadata: Vec<u8>) -> Self {
        IndexEntry {
            key: key.to_string(),
            integrity: None,
            time: epoch_ms(SystemTime::now()),
            size: 0,
            metadata: Some(metadata),
        }
    }

    /// A row that voids every older row of the same key
    pub fn deletion(key: &str) -> Self {
        IndexEntry {
            key: key.to_string(),
            integrity: None,
            time: epoch_ms(SystemTime::now()),
            size: 0,
            metadata: None,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.integrity.is_none() && self.metadata.is_none()
    }

    pub fn is_tombstone(&self) -> bool {
        self.integrity.is_none() && self.metadata.is_some()
    }

    pub fn write_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.time)
    }
}

/// Rows that are still live: everything written after the newest deletion marker.
///
/// `entries` are in write order, as returned by `index_query()`.
pub fn live_entries(entries: &[IndexEntry]) -> &[IndexEntry] {
    match entries.iter().rposition(IndexEntry::is_deletion) {
        Some(pos) => &entries[pos + 1..],
        None => entries,
    }
}

/// How to compact the rows of one key
pub struct CompactOpts<'a> {
    /// Whether the newer row (first argument) supersedes the older one (second argument)
    pub matches: &'a (dyn Fn(&IndexEntry, &IndexEntry) -> bool + Send + Sync),
    /// Rows failing this are dropped regardless of age
    pub validate: Option<&'a (dyn Fn(&IndexEntry) -> bool + Send + Sync)>,
}

/// Select the rows to keep, in write order.
///
/// Walks from the newest row: rows behind a deletion marker are gone, invalid rows are dropped and
/// of each group of rows that `matches` each other only the newest survives.
pub fn compact_entries(entries: &[IndexEntry], opts: &CompactOpts) -> Vec<IndexEntry> {
    let mut kept: Vec<&IndexEntry> = vec![];
    for entry in live_entries(entries).iter().rev() {
        if let Some(validate) = opts.validate {
            if !validate(entry) {
                continue;
            }
        }
        if kept.iter().any(|newer| (opts.matches)(newer, entry)) {
            continue;
        }
        kept.push(entry);
    }
    kept.into_iter().rev().cloned().collect()
}

/* Bucket file framing:
 * [u32 BE payload length][16 bytes blake2b-128 of payload][payload: msgpack IndexEntry]
 * A torn write at the tail leaves a short frame which is ignored on read.
 */
const FRAME_HEADER: usize = 4 + 16;

pub(crate) fn encode_frame(entry: &IndexEntry) -> Result<Vec<u8>> {
    let payload = rmp_serde::encode::to_vec(entry).or_err(InvalidIndex, "encode index entry")?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&Blake2b128::digest(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode every well formed frame in `buf`
pub(crate) fn decode_all_frames(buf: &[u8]) -> Vec<IndexEntry> {
    let mut entries = vec![];
    let mut rest = buf;
    while rest.len() >= FRAME_HEADER {
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[..4]);
        let len = u32::from_be_bytes(len) as usize;
        if rest.len() < FRAME_HEADER + len {
            warn!("truncated index record, ignoring the tail");
            break;
        }
        let checksum = &rest[4..FRAME_HEADER];
        let payload = &rest[FRAME_HEADER..FRAME_HEADER + len];
        rest = &rest[FRAME_HEADER + len..];

        if Blake2b128::digest(payload).as_slice() != checksum {
            warn!("index record checksum mismatch, skipping");
            continue;
        }
        match rmp_serde::from_slice::<IndexEntry>(payload) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("undecodable index record: {e}"),
        }
    }
    entries
}

/// Decode the frames of `key`. Different keys may share a bucket.
pub(crate) fn decode_frames(buf: &[u8], key: &str) -> Vec<IndexEntry> {
    let mut entries = decode_all_frames(buf);
    entries.retain(|e| e.key == key);
    entries
}
