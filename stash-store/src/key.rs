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

//! Hashing of index keys

use blake2::{Blake2b, Digest};

// 16-byte / 128-bit hash: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

/*
 * blake2 gives consistent output across machines, which matters because key hashes name
 * index files on disk. Hashes like ahash are only good for in memory tables.
 */
pub type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

/// Hash a key (String or Bytes) to [HashBinary]
pub fn hash_key<K: AsRef<[u8]>>(key: K) -> HashBinary {
    let mut hasher = Blake2b128::new();
    hasher.update(key.as_ref());
    hasher.finalize().into()
}

/// Hex string of a [HashBinary]
pub fn hex2str(hex: &[u8]) -> String {
    hex::encode(hex)
}
