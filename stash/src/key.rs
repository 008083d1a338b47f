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

//! Cache key

use http::Method;
use stash_store::key::{hash_key, hex2str, HashBinary};
use std::fmt::{Display, Formatter, Result as FmtResult};
use url::Url;

/// The namespace every request cache key lives under
pub const KEY_PREFIX: &str = "make-fetch-happen:request-cache:";

/// The index key of a request
///
/// Only the URL is significant. Headers never take part, variants under the same key are told
/// apart by [crate::variance].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// The key for `url`
    ///
    /// The fragment is dropped. Scheme and host are lowercased and a default port is omitted,
    /// which [Url] already guarantees once parsed.
    pub fn for_url(url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        CacheKey(format!("{KEY_PREFIX}{url}"))
    }

    /// The key for a request.
    ///
    /// GET and HEAD share the key. Other methods map to the same key too: they never read or
    /// write content, but they have to reach the rows they invalidate.
    pub fn for_request(_method: &Method, url: &Url) -> Self {
        Self::for_url(url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 128 bit hash of the key
    pub fn primary_bin(&self) -> HashBinary {
        hash_key(&self.0)
    }

    /// The hex string of [Self::primary_bin()], for logging
    pub fn primary(&self) -> String {
        hex2str(&self.primary_bin())
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_get_and_head_share() {
        let u = url("https://registry.test/pkg?x=1");
        assert_eq!(
            CacheKey::for_request(&Method::GET, &u),
            CacheKey::for_request(&Method::HEAD, &u)
        );
        assert_eq!(
            CacheKey::for_request(&Method::GET, &u).as_str(),
            "make-fetch-happen:request-cache:https://registry.test/pkg?x=1"
        );
    }

    #[test]
    fn test_distinct_urls() {
        let urls = [
            "https://registry.test/a",
            "https://registry.test/b",
            "https://registry.test/a?q=1",
            "http://registry.test/a",
            "https://registry.test:8443/a",
            "https://other.test/a",
        ];
        for (i, a) in urls.iter().enumerate() {
            for b in urls.iter().skip(i + 1) {
                assert_ne!(
                    CacheKey::for_request(&Method::GET, &url(a)),
                    CacheKey::for_request(&Method::GET, &url(b)),
                    "{a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn test_normalization() {
        let a = CacheKey::for_url(&url("HTTPS://Registry.Test:443/a#frag"));
        let b = CacheKey::for_url(&url("https://registry.test/a"));
        assert_eq!(a, b);
        assert_eq!(a.primary(), b.primary());
        assert_eq!(a.primary().len(), 32);
    }
}
