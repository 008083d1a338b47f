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

//! Cache configuration
//!
//! The configuration is a YAML file, every key is optional:
//! ```yaml
//! ---
//! version: 1
//! cache_path: /var/cache/stash
//! buffer_threshold: 5242880
//! default_mode: default
//! algorithms: [sha512]
//! ```

use crate::pipeline::DEFAULT_BUFFER_THRESHOLD;
use crate::policy::{PolicyConf, HEURISTIC_FRACTION, HEURISTIC_WARNING_AGE};
use crate::CacheMode;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use stash_error::{Error, ErrorType, ErrorType::*, OrErr, Result};
use stash_store::Algorithm;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const CONF_ERROR: ErrorType = ErrorType::new("ConfError");

/// The configuration file
///
/// Keys this struct does not know are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConf {
    pub version: usize,
    /// Where the on disk cache lives. Without it the cache is kept in memory.
    pub cache_path: Option<PathBuf>,
    /// Bodies with a known length below this are buffered before being stored, others stream
    pub buffer_threshold: u64,
    /// Share of `Date - Last-Modified` granted as heuristic freshness
    pub heuristic_fraction: f64,
    /// Seconds after which a response served on heuristic freshness carries a `113` warning
    pub heuristic_warning_age: u64,
    /// Default limit of redirects to follow
    pub max_redirects: usize,
    /// Cache mode of requests that do not set one
    pub default_mode: CacheMode,
    /// Hash algorithms to compute for stored bodies, `sha512` if empty
    pub algorithms: Vec<Algorithm>,
    /// Read Cache-Control as a shared cache would
    pub shared: bool,
}

impl Default for CacheConf {
    fn default() -> Self {
        CacheConf {
            version: 1,
            cache_path: None,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            heuristic_fraction: HEURISTIC_FRACTION,
            heuristic_warning_age: HEURISTIC_WARNING_AGE.as_secs(),
            max_redirects: 20,
            default_mode: CacheMode::Default,
            algorithms: vec![Algorithm::Sha512],
            shared: false,
        }
    }
}

impl CacheConf {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(FileReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: CacheConf = serde_yaml::from_str(conf_str)
            .or_err_with(CONF_ERROR, || format!("Unable to parse yaml conf {conf_str}"))?;
        trace!("Loaded conf: {conf:?}");
        conf.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).or_err(CONF_ERROR, "Unable to serialize conf")
    }

    pub fn validate(self) -> Result<Self> {
        if !self.heuristic_fraction.is_finite() || !(0.0..=1.0).contains(&self.heuristic_fraction)
        {
            return Error::e_explain(
                CONF_ERROR,
                format!(
                    "heuristic_fraction must be within [0, 1], got {}",
                    self.heuristic_fraction
                ),
            );
        }
        if let Some(path) = self.cache_path.as_ref() {
            if path.as_os_str().is_empty() {
                return Error::e_explain(CONF_ERROR, "cache_path is empty");
            }
        }
        Ok(self)
    }

    /// The algorithms to hash with, never empty
    pub fn algorithms(&self) -> Vec<Algorithm> {
        if self.algorithms.is_empty() {
            vec![Algorithm::default()]
        } else {
            self.algorithms.clone()
        }
    }

    pub fn policy_conf(&self) -> PolicyConf {
        PolicyConf {
            shared: self.shared,
            heuristic_fraction: self.heuristic_fraction,
            heuristic_warning_age: Duration::from_secs(self.heuristic_warning_age),
        }
    }
}
