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

//! Per request options

use crate::conf::CacheConf;
use crate::CacheMode;

use http::header::HeaderName;
use serde::de::{Deserializer, IgnoredAny};
use serde::{Deserialize, Serialize};
use stash_store::{Algorithm, Integrity};
use std::time::Duration;

pub const DEFAULT_RETRY_FACTOR: f64 = 10.0;
/// Milliseconds
pub const DEFAULT_RETRY_MIN_TIMEOUT: u64 = 1000;
/// Milliseconds
pub const DEFAULT_RETRY_MAX_TIMEOUT: u64 = 60_000;

/// What to do with a 3xx that carries a `Location`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    /// Follow it, up to [FetchOptions::follow] hops
    #[default]
    Follow,
    /// Hand the 3xx to the caller
    Manual,
    /// Fail with `ENOREDIRECT`
    Error,
}

/// Retry settings handed to the transport
///
/// Deserializes from a number (`3`), a numeric string (`"3"`) or a map. Anything else, including
/// a string that is not a number, means no retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryConf {
    pub retries: u32,
    /// Backoff multiplier between attempts
    pub factor: Option<f64>,
    /// Minimum backoff, milliseconds
    pub min_timeout: Option<u64>,
    /// Maximum backoff, milliseconds
    pub max_timeout: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRetry {
    Number(u64),
    Text(String),
    Map {
        #[serde(default)]
        retries: Option<u32>,
        #[serde(default)]
        factor: Option<f64>,
        #[serde(default, alias = "minTimeout")]
        min_timeout: Option<u64>,
        #[serde(default, alias = "maxTimeout")]
        max_timeout: Option<u64>,
    },
    Other(IgnoredAny),
}

impl RetryConf {
    pub fn retries(retries: u32) -> Self {
        RetryConf {
            retries,
            ..Default::default()
        }
    }

    /// `"10"` is 10 retries, anything unparsable is none
    pub fn from_text(s: &str) -> Self {
        Self::retries(s.trim().parse().unwrap_or(0))
    }

    /// How long to wait before retry number `attempt`, counting from 0
    ///
    /// `min_timeout * factor ^ attempt`, capped at `max_timeout`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.factor.unwrap_or(DEFAULT_RETRY_FACTOR).max(1.0);
        let min = self.min_timeout.unwrap_or(DEFAULT_RETRY_MIN_TIMEOUT) as f64;
        let max = self.max_timeout.unwrap_or(DEFAULT_RETRY_MAX_TIMEOUT) as f64;
        let wait = (min * factor.powi(attempt.min(64) as i32)).min(max);
        Duration::from_millis(wait as u64)
    }
}

impl<'de> Deserialize<'de> for RetryConf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawRetry::deserialize(deserializer)? {
            RawRetry::Number(n) => Self::retries(u32::try_from(n).unwrap_or(u32::MAX)),
            RawRetry::Text(s) => Self::from_text(&s),
            RawRetry::Map {
                retries,
                factor,
                min_timeout,
                max_timeout,
            } => RetryConf {
                retries: retries.unwrap_or(0),
                factor,
                min_timeout,
                max_timeout,
            },
            RawRetry::Other(_) => RetryConf::default(),
        })
    }
}

/// Options of one fetch
///
/// Unset fields fall back to the client defaults (see [crate::FetchClient::defaults]) and then
/// to the [CacheConf].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub cache: Option<CacheMode>,
    /// The body has to match this, `EINTEGRITY` otherwise
    pub integrity: Option<Integrity>,
    pub algorithms: Option<Vec<Algorithm>>,
    /// Whether the transport may negotiate a content encoding
    pub compress: Option<bool>,
    pub redirect: Option<RedirectMode>,
    /// Maximum number of redirects to follow
    pub follow: Option<usize>,
    pub retry: Option<RetryConf>,
    /// Response headers to store on top of the default set
    pub cache_additional_headers: Option<Vec<HeaderName>>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(mut self, mode: CacheMode) -> Self {
        self.cache = Some(mode);
        self
    }

    pub fn integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = Some(integrity);
        self
    }

    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = Some(algorithms);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    pub fn redirect(mut self, redirect: RedirectMode) -> Self {
        self.redirect = Some(redirect);
        self
    }

    pub fn follow(mut self, follow: usize) -> Self {
        self.follow = Some(follow);
        self
    }

    pub fn retry(mut self, retry: RetryConf) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn cache_additional_headers(mut self, headers: Vec<HeaderName>) -> Self {
        self.cache_additional_headers = Some(headers);
        self
    }

    /// Fill every unset field from `defaults`
    pub fn or(self, defaults: &FetchOptions) -> Self {
        FetchOptions {
            cache: self.cache.or(defaults.cache),
            integrity: self.integrity.or_else(|| defaults.integrity.clone()),
            algorithms: self.algorithms.or_else(|| defaults.algorithms.clone()),
            compress: self.compress.or(defaults.compress),
            redirect: self.redirect.or(defaults.redirect),
            follow: self.follow.or(defaults.follow),
            retry: self.retry.or_else(|| defaults.retry.clone()),
            cache_additional_headers: self
                .cache_additional_headers
                .or_else(|| defaults.cache_additional_headers.clone()),
        }
    }

    /// Resolve against the configuration
    pub fn resolve(&self, conf: &CacheConf) -> ResolvedOptions {
        let algorithms = match self.algorithms.as_ref() {
            Some(algos) if !algos.is_empty() => algos.clone(),
            _ => conf.algorithms(),
        };
        ResolvedOptions {
            cache: self.cache.unwrap_or(conf.default_mode),
            integrity: self.integrity.clone(),
            algorithms,
            compress: self.compress.unwrap_or(true),
            redirect: self.redirect.unwrap_or_default(),
            follow: self.follow.unwrap_or(conf.max_redirects),
            retry: self.retry.clone().unwrap_or_default(),
            cache_additional_headers: self.cache_additional_headers.clone().unwrap_or_default(),
        }
    }
}

/// [FetchOptions] with every field decided
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub cache: CacheMode,
    pub integrity: Option<Integrity>,
    pub algorithms: Vec<Algorithm>,
    pub compress: bool,
    pub redirect: RedirectMode,
    pub follow: usize,
    pub retry: RetryConf,
    pub cache_additional_headers: Vec<HeaderName>,
}
