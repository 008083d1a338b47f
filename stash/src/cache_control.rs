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

//! Parsing of `Cache-Control` (and `Pragma`) directives

use http::{HeaderMap, HeaderValue};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use stash_error::{Error, ErrorType, Result};
use std::num::IntErrorKind;
use std::str;

/// delta-seconds that overflow are read as 2^31, see RFC 9111 section 1.2.2
pub const DELTA_SECONDS_OVERFLOW_VALUE: u32 = 2147483648;

/// The raw value of a directive, quotes included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveValue(pub Vec<u8>);

impl DirectiveValue {
    /// The value with surrounding `"` removed
    pub fn unquoted(&self) -> &[u8] {
        self.0
            .strip_prefix(b"\"")
            .and_then(|v| v.strip_suffix(b"\""))
            .unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> Result<&str> {
        str::from_utf8(self.unquoted()).or_else(|e| {
            Error::e_because(ErrorType::InvalidHTTPHeader, "directive value is not utf8", e)
        })
    }

    /// Read the value as delta-seconds, saturating at [DELTA_SECONDS_OVERFLOW_VALUE]
    pub fn as_delta_seconds(&self) -> Result<u32> {
        match self.as_str()?.parse::<u32>() {
            Ok(secs) => Ok(secs),
            Err(e) if e.kind() == &IntErrorKind::PosOverflow => Ok(DELTA_SECONDS_OVERFLOW_VALUE),
            Err(e) => Error::e_because(
                ErrorType::InvalidHTTPHeader,
                "directive value is not delta-seconds",
                e,
            ),
        }
    }
}

// directive = token [ "=" ( token / quoted-string ) ], separated by `,` (or `;`, which is not
// standard but seen in the wild)
static RE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?:^|(?:\s*[,;]\s*))([^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+)(?:=((?:[^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+|(?:"(?:[^"\\]|\\.)*"))))?"#)
        .unwrap()
});

/// Parsed directives, in the order they first appeared
#[derive(Debug, Default)]
pub struct CacheControl {
    pub directives: IndexMap<String, Option<DirectiveValue>>,
}

impl CacheControl {
    fn parse<'a>(lines: impl Iterator<Item = &'a HeaderValue>) -> Self {
        let mut directives = IndexMap::new();
        for line in lines {
            for captures in RE_DIRECTIVE.captures_iter(line.as_bytes()) {
                // names are matched case-insensitively, values keep their case
                let Some(name) = captures
                    .get(1)
                    .and_then(|m| str::from_utf8(m.as_bytes()).ok())
                    .map(str::to_ascii_lowercase)
                else {
                    continue;
                };
                let value = captures.get(2).map(|m| DirectiveValue(m.as_bytes().to_vec()));
                directives.insert(name, value);
            }
        }
        CacheControl { directives }
    }

    /// Parse every `header_name` line of `headers`, `None` if there is none
    pub fn from_headers_named(header_name: &str, headers: &HeaderMap) -> Option<Self> {
        if !headers.contains_key(header_name) {
            return None;
        }
        Some(Self::parse(headers.get_all(header_name).iter()))
    }

    /// Parse `Cache-Control`
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::from_headers_named("cache-control", headers)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    fn has_key_without_value(&self, key: &str) -> bool {
        matches!(self.directives.get(key), Some(None))
    }

    fn delta_seconds(&self, key: &str) -> Result<Option<u32>> {
        match self.directives.get(key) {
            Some(Some(value)) => value.as_delta_seconds().map(Some),
            _ => Ok(None),
        }
    }

    pub fn public(&self) -> bool {
        self.has_key("public")
    }

    /// The bare `private` directive. `private="field"` only restricts some headers.
    pub fn private(&self) -> bool {
        self.has_key_without_value("private")
    }

    /// The bare `no-cache` directive
    pub fn no_cache(&self) -> bool {
        self.has_key_without_value("no-cache")
    }

    pub fn no_store(&self) -> bool {
        self.has_key("no-store")
    }

    pub fn max_age(&self) -> Result<Option<u32>> {
        self.delta_seconds("max-age")
    }

    pub fn s_maxage(&self) -> Result<Option<u32>> {
        self.delta_seconds("s-maxage")
    }

    pub fn must_revalidate(&self) -> bool {
        self.has_key("must-revalidate")
    }

    pub fn proxy_revalidate(&self) -> bool {
        self.has_key("proxy-revalidate")
    }

    /// `immutable`, RFC 8246: the body will not change while fresh
    pub fn immutable(&self) -> bool {
        self.has_key("immutable")
    }

    pub fn only_if_cached(&self) -> bool {
        self.has_key("only-if-cached")
    }

    /// The freshness lifetime the directives grant, `None` if they grant none.
    ///
    /// `no-cache` is `Some(0)`. `s-maxage` only counts for a `shared` cache. Unparsable values
    /// are ignored.
    pub fn fresh_sec(&self, shared: bool) -> Option<u32> {
        if self.no_cache() {
            return Some(0);
        }
        if shared {
            if let Ok(Some(secs)) = self.s_maxage() {
                return Some(secs);
            }
        }
        self.max_age().ok().flatten()
    }

    /// Whether a stored response may be served stale when the origin cannot be reached
    pub fn allow_stale_on_error(&self, shared: bool) -> bool {
        !(self.must_revalidate() || (shared && self.proxy_revalidate()))
    }
}

/// Whether `Pragma: no-cache` is set
pub fn pragma_no_cache(headers: &HeaderMap) -> bool {
    CacheControl::from_headers_named("pragma", headers).is_some_and(|p| p.has_key("no-cache"))
}
