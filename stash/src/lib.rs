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

//! An HTTP caching fetch layer
//!
//! [FetchClient] sits between a call site and a [Transport]. For every request it decides
//! whether a stored response can answer it, whether that response has to be revalidated first
//! and how the origin's answer updates the store. Bodies are stored content-addressed through
//! [stash_store] and stream to the caller and to the store at the same time.
//!
//! # Example
//! ```no_run
//! # async fn run(transport: std::sync::Arc<dyn stash::Transport>) -> stash_error::Result<()> {
//! use stash::{CacheConf, FetchClient, FetchOptions, Request};
//!
//! let conf = CacheConf {
//!     cache_path: Some("/tmp/stash".into()),
//!     ..Default::default()
//! };
//! let client = FetchClient::from_conf(conf, transport)?;
//! let mut res = client
//!     .fetch(Request::get("https://registry.test/pkg")?, FetchOptions::new())
//!     .await?;
//! println!("{:?}", res.headers().get("x-local-cache-status"));
//! let body = res.bytes().await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::new_without_default)]

use serde::{Deserialize, Serialize};
use stash_error::{Error, ErrorType, Result};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub mod cache_control;
pub mod conf;
pub mod engine;
pub mod fetch;
pub mod key;
pub mod meta;
pub mod options;
pub mod pipeline;
pub mod policy;
pub mod redirect;
pub mod transport;
pub mod variance;
pub mod warning;

pub use conf::CacheConf;
pub use engine::{CacheEngine, CachedResponse};
pub use fetch::{FetchClient, Response};
pub use key::CacheKey;
pub use options::{FetchOptions, RedirectMode, RetryConf};
pub use pipeline::{Body, PipelineMode, Settled};
pub use policy::{CachePolicy, PolicyConf};
pub use transport::{BodyStream, Request, Transport, TransportOpts, TransportResponse};

#[cfg(feature = "reqwest")]
pub use transport::http_client::ReqwestTransport;

// re-exported for convenience
pub use stash_store::{Algorithm, Integrity};

/// How a request may use the cache, the `cache` option of a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Serve fresh entries, revalidate stale ones, fetch when absent
    #[default]
    Default,
    /// Ignore the cache entirely
    NoStore,
    /// Always fetch unconditionally, then store the result
    Reload,
    /// Always ask the origin, conditionally when an entry exists
    NoCache,
    /// Serve any entry fresh or stale, fetch only when absent
    ForceCache,
    /// Serve any entry fresh or stale, fail with `ENOTCACHED` otherwise
    OnlyIfCached,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Default => "default",
            CacheMode::NoStore => "no-store",
            CacheMode::Reload => "reload",
            CacheMode::NoCache => "no-cache",
            CacheMode::ForceCache => "force-cache",
            CacheMode::OnlyIfCached => "only-if-cached",
        }
    }
}

impl Display for CacheMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = Box<Error>;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "default" => CacheMode::Default,
            "no-store" => CacheMode::NoStore,
            "reload" => CacheMode::Reload,
            "no-cache" => CacheMode::NoCache,
            "force-cache" => CacheMode::ForceCache,
            "only-if-cached" => CacheMode::OnlyIfCached,
            other => {
                return Error::e_explain(
                    ErrorType::new("InvalidCacheMode"),
                    format!("unknown cache mode {other}"),
                )
            }
        })
    }
}

/// How a response was produced, reported in `x-local-cache-status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fetched from the origin, nothing usable was stored
    Miss,
    /// Served from the cache without contacting the origin
    Hit,
    /// Served from the cache although stale
    Stale,
    /// The origin confirmed the stored response with a 304
    Revalidated,
    /// The origin replaced the stored response
    Updated,
    /// The cache was not involved
    Skip,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Miss => "miss",
            CacheStatus::Hit => "hit",
            CacheStatus::Stale => "stale",
            CacheStatus::Revalidated => "revalidated",
            CacheStatus::Updated => "updated",
            CacheStatus::Skip => "skip",
        }
    }
}

impl Display for CacheStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
