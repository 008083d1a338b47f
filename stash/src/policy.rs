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

//! Storability, freshness and revalidation of cached responses
//!
//! The cache is private (one user agent) unless [PolicyConf::shared] is set, which changes how
//! `s-maxage`, `private` and `proxy-revalidate` are read.

use crate::cache_control::{pragma_no_cache, CacheControl};

use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use httpdate::HttpDate;
use log::{debug, warn};
use std::time::{Duration, SystemTime};

/// Share of `Date - Last-Modified` used as the freshness lifetime when nothing explicit is given
pub const HEURISTIC_FRACTION: f64 = 0.1;

/// Responses served on heuristic freshness older than this carry a warning
pub const HEURISTIC_WARNING_AGE: Duration = Duration::from_secs(24 * 3600);

/// Request headers that make a request conditional
static CONDITIONAL_HEADERS: [header::HeaderName; 5] = [
    header::IF_MODIFIED_SINCE,
    header::IF_NONE_MATCH,
    header::IF_UNMODIFIED_SINCE,
    header::IF_MATCH,
    header::IF_RANGE,
];

/// Headers of a 304 that must not replace the stored ones: they describe the (empty) 304 body
static NOT_MERGED_ON_304: [header::HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::TRANSFER_ENCODING,
    header::CONTENT_RANGE,
];

/// Tunables of the freshness computation
#[derive(Debug, Clone)]
pub struct PolicyConf {
    /// Read directives as a shared cache would
    pub shared: bool,
    pub heuristic_fraction: f64,
    pub heuristic_warning_age: Duration,
}

impl Default for PolicyConf {
    fn default() -> Self {
        PolicyConf {
            shared: false,
            heuristic_fraction: HEURISTIC_FRACTION,
            heuristic_warning_age: HEURISTIC_WARNING_AGE,
        }
    }
}

/// The request side of a policy decision
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
}

/// The response side of a policy decision
#[derive(Debug, Clone, Copy)]
pub struct StoredResponse<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    /// When the response was received, i.e. the write time of a stored row
    pub response_time: SystemTime,
}

/// Where the freshness lifetime came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `max-age`, `s-maxage` or `Expires`
    Explicit,
    /// A fraction of the time since `Last-Modified`
    Heuristic,
    /// `immutable`
    Immutable,
    /// Nothing grants freshness
    Unspecified,
}

/// Whether the request carries any precondition header
pub fn is_header_conditional(headers: &HeaderMap) -> bool {
    CONDITIONAL_HEADERS.iter().any(|h| headers.contains_key(h))
}

/// Whether the request allows its response to be written to the cache
pub fn request_storable(req: &RequestParts) -> bool {
    if !matches!(*req.method, Method::GET | Method::HEAD) {
        return false;
    }
    if CacheControl::from_headers(req.headers).is_some_and(|cc| cc.no_store()) {
        return false;
    }
    !is_header_conditional(req.headers)
}

// statuses a cache knows how to handle at all
fn understood_status(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 204 | 300 | 301 | 302 | 303 | 307 | 308 | 404 | 405 | 410 | 414 | 501
    )
}

// statuses that may be stored without explicit freshness, RFC 9110 section 15.1
fn heuristically_cacheable(status: StatusCode) -> bool {
    matches!(
        status.as_u16(),
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501
    )
}

/// Whether the response allows itself to be stored
pub fn response_storable(status: StatusCode, headers: &HeaderMap, shared: bool) -> bool {
    if !understood_status(status) {
        return false;
    }
    let cc = CacheControl::from_headers(headers);
    if let Some(cc) = cc.as_ref() {
        if cc.no_store() || (shared && cc.private()) {
            return false;
        }
    }
    let explicit = headers.contains_key(header::EXPIRES)
        || cc.as_ref().is_some_and(|cc| {
            cc.public() || cc.has_key("max-age") || (shared && cc.has_key("s-maxage"))
        });
    explicit || heuristically_cacheable(status)
}

fn parse_http_date(value: &HeaderValue) -> Option<SystemTime> {
    let s = value.to_str().ok()?;
    s.parse::<HttpDate>()
        .map(SystemTime::from)
        .map_err(|e| debug!("invalid http date {s}: {e}"))
        .ok()
}

// RFC 9111 section 5.3: several Expires are invalid, an invalid Expires is in the past
fn expires_time(headers: &HeaderMap) -> Option<SystemTime> {
    let mut values = headers.get_all(header::EXPIRES).iter();
    let first = values.next()?;
    if values.next().is_some() {
        warn!("multiple Expires headers, treating as expired");
        return Some(SystemTime::UNIX_EPOCH);
    }
    Some(parse_http_date(first).unwrap_or(SystemTime::UNIX_EPOCH))
}

fn age_header(headers: &HeaderMap) -> Duration {
    headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default()
}

/// The policy of one stored (or about to be stored) response for one request
#[derive(Debug, Clone)]
pub struct CachePolicy {
    storable: bool,
    lifetime: Duration,
    age: Duration,
    freshness: Freshness,
    no_cache: bool,
    allow_stale_on_error: bool,
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
    heuristic_warning_age: Duration,
}

impl CachePolicy {
    pub fn new(
        req: &RequestParts,
        res: &StoredResponse,
        now: SystemTime,
        conf: &PolicyConf,
    ) -> Self {
        let cc = CacheControl::from_headers(res.headers);
        let date = res
            .headers
            .get(header::DATE)
            .and_then(parse_http_date)
            .unwrap_or(res.response_time);

        let (lifetime, freshness) = if cc.as_ref().is_some_and(|cc| cc.immutable()) {
            (Duration::MAX, Freshness::Immutable)
        } else if let Some(secs) = cc.as_ref().and_then(|cc| cc.fresh_sec(conf.shared)) {
            (Duration::from_secs(secs as u64), Freshness::Explicit)
        } else if let Some(expires) = expires_time(res.headers) {
            (
                expires.duration_since(date).unwrap_or_default(),
                Freshness::Explicit,
            )
        } else if let Some(last_modified) =
            res.headers.get(header::LAST_MODIFIED).and_then(parse_http_date)
        {
            let since = date.duration_since(last_modified).unwrap_or_default();
            (
                since.mul_f64(conf.heuristic_fraction.max(0.0)),
                Freshness::Heuristic,
            )
        } else {
            (Duration::ZERO, Freshness::Unspecified)
        };

        let resident = now.duration_since(res.response_time).unwrap_or_default();
        CachePolicy {
            storable: request_storable(req)
                && response_storable(res.status, res.headers, conf.shared),
            lifetime,
            age: age_header(res.headers).saturating_add(resident),
            freshness,
            no_cache: cc.as_ref().is_some_and(|cc| cc.no_cache())
                || pragma_no_cache(res.headers),
            allow_stale_on_error: cc
                .as_ref()
                .map_or(true, |cc| cc.allow_stale_on_error(conf.shared)),
            etag: res.headers.get(header::ETAG).cloned(),
            last_modified: res.headers.get(header::LAST_MODIFIED).cloned(),
            heuristic_warning_age: conf.heuristic_warning_age,
        }
    }

    /// Whether the response may be written
    pub fn storable(&self) -> bool {
        self.storable
    }

    /// Current age: the `Age` it arrived with plus the time spent in the cache
    pub fn age(&self) -> Duration {
        self.age
    }

    /// The freshness lifetime, [Duration::MAX] when immutable
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    /// Time left before the response goes stale
    pub fn time_to_live(&self) -> Duration {
        if self.no_cache {
            return Duration::ZERO;
        }
        self.lifetime.saturating_sub(self.age)
    }

    /// Whether the response can be served without asking the origin
    pub fn fresh(&self) -> bool {
        if self.no_cache {
            return false;
        }
        if self.freshness == Freshness::Immutable {
            return true;
        }
        self.age < self.lifetime
    }

    pub fn needs_revalidation(&self) -> bool {
        !self.fresh()
    }

    /// Whether the response may stand in when revalidation fails
    pub fn allow_stale_on_error(&self) -> bool {
        self.allow_stale_on_error
    }

    /// Whether serving this response calls for the `113` heuristic expiration warning
    pub fn heuristic_warning(&self) -> bool {
        self.freshness == Freshness::Heuristic && self.age > self.heuristic_warning_age
    }

    /// The validators to send when revalidating
    pub fn conditional_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(etag) = self.etag.as_ref() {
            headers.insert(header::IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = self.last_modified.as_ref() {
            headers.insert(header::IF_MODIFIED_SINCE, last_modified.clone());
        }
        headers
    }
}

/// The stored headers updated by a `304`
///
/// Every header present in the 304 replaces the stored one, headers absent from it are left
/// alone. `1xx` warnings of the stored response are dropped, RFC 7234 section 4.3.4.
pub fn merge_not_modified(stored: &HeaderMap, not_modified: &HeaderMap) -> HeaderMap {
    let mut merged = stored.clone();
    crate::warning::strip_1xx(&mut merged);
    for name in not_modified.keys() {
        if NOT_MERGED_ON_304.contains(name) {
            continue;
        }
        merged.remove(name);
        for value in not_modified.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}
