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

//! Subresource integrity strings
//!
//! An [Integrity] is a list of `<algorithm>-<base64 digest>` hashes separated by whitespace, e.g.
//! `sha512-z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg==`.
//! The strongest algorithm present is the authoritative one when two integrities are compared.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use stash_error::{Error, ErrorType::*, OrErr, Result};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Hash algorithms, ordered from the weakest to the strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha384 => Hasher::Sha384(Sha384::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Sha512
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Box<Error>;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Error::e_explain(
                InvalidIntegrity,
                format!("unsupported hash algorithm {other}"),
            ),
        }
    }
}

/// A single `<algorithm>-<base64 digest>` entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: Algorithm,
    /// base64 encoded digest
    pub digest: String,
}

impl Hash {
    /// The digest as lower case hex, used for content file names
    pub fn to_hex(&self) -> Result<String> {
        let raw = STANDARD
            .decode(&self.digest)
            .or_err(InvalidIntegrity, "digest is not base64")?;
        Ok(hex::encode(raw))
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}-{}", self.algorithm, self.digest)
    }
}

/// A parsed integrity string, strongest hash first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Integrity {
    hashes: Vec<Hash>,
}

impl Integrity {
    fn from_hashes(mut hashes: Vec<Hash>) -> Result<Self> {
        if hashes.is_empty() {
            return Error::e_explain(InvalidIntegrity, "no supported hash found");
        }
        // stable: keeps the given order among hashes of the same algorithm
        hashes.sort_by(|a, b| b.algorithm.cmp(&a.algorithm));
        Ok(Integrity { hashes })
    }

    /// Compute the integrity of `data` with each of `algorithms` (sha512 if empty)
    pub fn from_bytes(data: &[u8], algorithms: &[Algorithm]) -> Self {
        let mut hasher = IntegrityHasher::new(algorithms);
        hasher.update(data);
        hasher.finish().0
    }

    pub fn hashes(&self) -> &[Hash] {
        &self.hashes
    }

    /// The hash of the strongest algorithm present
    pub fn strongest(&self) -> &Hash {
        // never empty, see from_hashes()
        &self.hashes[0]
    }

    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut algos: Vec<Algorithm> = self.hashes.iter().map(|h| h.algorithm).collect();
        algos.dedup();
        algos
    }

    /// Check `self` against the `expected` integrity.
    ///
    /// Only the strongest algorithm of `expected` is compared. Returns that algorithm when one of
    /// our hashes for it matches one of the expected ones.
    pub fn matches(&self, expected: &Integrity) -> Option<Algorithm> {
        let algorithm = expected.strongest().algorithm;
        let found = self
            .hashes
            .iter()
            .filter(|h| h.algorithm == algorithm)
            .any(|h| expected.hashes.contains(h));
        found.then_some(algorithm)
    }
}

impl Display for Integrity {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        for (i, hash) in self.hashes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{hash}")?;
        }
        Ok(())
    }
}

impl FromStr for Integrity {
    type Err = Box<Error>;

    /// Unknown algorithms (e.g. `sha1`) and malformed entries are skipped. At least one supported
    /// hash must be present.
    fn from_str(s: &str) -> Result<Self> {
        let mut hashes = vec![];
        for token in s.split_ascii_whitespace() {
            let Some((algo, rest)) = token.split_once('-') else {
                continue;
            };
            let Ok(algorithm) = algo.parse::<Algorithm>() else {
                continue;
            };
            // drop `?opt` suffixes
            let digest = rest.split('?').next().unwrap_or_default();
            if digest.is_empty() || STANDARD.decode(digest).is_err() {
                continue;
            }
            hashes.push(Hash {
                algorithm,
                digest: digest.to_string(),
            });
        }
        Self::from_hashes(hashes)
            .map_err(|e| e.more_context(format!("failed to parse integrity {s:?}")))
    }
}

impl TryFrom<String> for Integrity {
    type Error = Box<Error>;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Integrity> for String {
    fn from(i: Integrity) -> Self {
        i.to_string()
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> Hash {
        let (algorithm, raw) = match self {
            Self::Sha256(h) => (Algorithm::Sha256, h.finalize().to_vec()),
            Self::Sha384(h) => (Algorithm::Sha384, h.finalize().to_vec()),
            Self::Sha512(h) => (Algorithm::Sha512, h.finalize().to_vec()),
        };
        Hash {
            algorithm,
            digest: STANDARD.encode(raw),
        }
    }
}

/// Incremental integrity and size computation over a body that arrives in chunks
pub struct IntegrityHasher {
    hashers: Vec<Hasher>,
    size: u64,
}

impl IntegrityHasher {
    pub fn new(algorithms: &[Algorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        if algorithms.is_empty() {
            algorithms.push(Algorithm::default());
        }
        algorithms.sort();
        algorithms.dedup();
        IntegrityHasher {
            hashers: algorithms.iter().map(Algorithm::hasher).collect(),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for hasher in self.hashers.iter_mut() {
            hasher.update(data);
        }
        self.size += data.len() as u64;
    }

    /// Bytes seen so far
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> (Integrity, u64) {
        // hashers are sorted weakest first and never empty
        let hashes = self.hashers.into_iter().rev().map(Hasher::finish).collect();
        (Integrity { hashes }, self.size)
    }
}

/// Verifies a body against an expected [Integrity] as it streams through
pub struct IntegrityChecker {
    expected: Integrity,
    hasher: IntegrityHasher,
}

impl IntegrityChecker {
    pub fn new(expected: Integrity) -> Self {
        let hasher = IntegrityHasher::new(&[expected.strongest().algorithm]);
        IntegrityChecker { expected, hasher }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish the check. `EINTEGRITY` on mismatch.
    pub fn finish(self) -> Result<(Integrity, u64)> {
        let (actual, size) = self.hasher.finish();
        if actual.matches(&self.expected).is_none() {
            return Error::e_explain(
                IntegrityError,
                format!(
                    "integrity check failed: wanted {} but got {}",
                    self.expected, actual
                ),
            );
        }
        Ok((actual, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        let i = Integrity::from_bytes(b"hello, world!", &[]);
        assert_eq!(i.hashes().len(), 1);
        assert_eq!(i.strongest().algorithm, Algorithm::Sha512);
        let again = Integrity::from_bytes(b"hello, world!", &[Algorithm::Sha512]);
        assert_eq!(i, again);
        assert!(i.to_string().starts_with("sha512-"));
    }

    #[test]
    fn test_parse_roundtrip_and_order() {
        let multi = Integrity::from_bytes(b"abc", &[Algorithm::Sha256, Algorithm::Sha512]);
        assert_eq!(multi.algorithms(), vec![Algorithm::Sha512, Algorithm::Sha256]);
        let parsed: Integrity = multi.to_string().parse().unwrap();
        assert_eq!(parsed, multi);
    }

    #[test]
    fn test_parse_skips_unknown() {
        let hello = Integrity::from_bytes(b"hello", &[]);
        let s = format!("sha1-deadbeef {hello}?foo md5-xyz");
        let i: Integrity = s.parse().unwrap();
        assert_eq!(i, hello);

        let e = "sha1-deadbeef".parse::<Integrity>().unwrap_err();
        assert_eq!(e.etype(), &InvalidIntegrity);
        assert!("".parse::<Integrity>().is_err());
    }

    #[test]
    fn test_matches_uses_strongest_expected() {
        let data = b"some content";
        let both = Integrity::from_bytes(data, &[Algorithm::Sha256, Algorithm::Sha512]);
        let only256 = Integrity::from_bytes(data, &[Algorithm::Sha256]);
        assert_eq!(both.matches(&only256), Some(Algorithm::Sha256));
        assert_eq!(only256.matches(&both), None); // sha512 is authoritative
        let other = Integrity::from_bytes(b"other", &[Algorithm::Sha512]);
        assert_eq!(both.matches(&other), None);
    }

    #[test]
    fn test_hasher_in_chunks() {
        let mut hasher = IntegrityHasher::new(&[Algorithm::Sha384]);
        hasher.update(b"hello, ");
        hasher.update(b"world!");
        let (i, size) = hasher.finish();
        assert_eq!(size, 13);
        assert_eq!(i, Integrity::from_bytes(b"hello, world!", &[Algorithm::Sha384]));
    }

    #[test]
    fn test_checker() {
        let expected = Integrity::from_bytes(b"good", &[]);
        let mut checker = IntegrityChecker::new(expected.clone());
        checker.update(b"good");
        assert_eq!(checker.finish().unwrap().0, expected);

        let mut checker = IntegrityChecker::new(expected);
        checker.update(b"bad");
        let e = checker.finish().unwrap_err();
        assert_eq!(e.code(), Some("EINTEGRITY"));
    }

    #[test]
    fn test_hex() {
        let i = Integrity::from_bytes(b"", &[Algorithm::Sha256]);
        assert_eq!(
            i.strongest().to_hex().unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
