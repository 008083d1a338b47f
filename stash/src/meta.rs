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

//! Metadata recorded with every index row

use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use stash_error::{Error, ErrorType::*, OkOrErr, OrErr, Result};
use stash_store::{Algorithm, IndexEntry};
use url::Url;

use crate::variance::vary_header_names;

/// Response headers replayed from the cache. Everything else is dropped before writing.
static KEEP_RESPONSE_HEADERS: [HeaderName; 14] = [
    header::AGE,
    header::CACHE_CONTROL,
    header::CONTENT_LANGUAGE,
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::DATE,
    header::ETAG,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::LINK,
    header::LOCATION,
    header::PRAGMA,
    header::VARY,
    header::WARNING,
];

/// How the body was fetched, recorded so a later read knows how to treat it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaOptions {
    pub algorithms: Vec<Algorithm>,
    pub compress: bool,
}

impl Default for MetaOptions {
    fn default() -> Self {
        MetaOptions {
            algorithms: vec![Algorithm::default()],
            compress: true,
        }
    }
}

mod internal_meta {
    use super::*;

    pub(crate) type Headers = Vec<(String, Vec<u8>)>;

    #[derive(Debug, Deserialize, Serialize)]
    pub(crate) struct MetaV1 {
        pub(crate) version: u8,
        pub(crate) url: String,
        pub(crate) status: u16,
        pub(crate) req_headers: Headers,
        pub(crate) res_headers: Headers,
        pub(crate) options: MetaOptions,
        // new fields go below, each one with #[serde(default)]
    }

    impl MetaV1 {
        pub const VERSION: u8 = 1;
    }

    pub(crate) fn encode_headers(headers: &HeaderMap) -> Headers {
        headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect()
    }

    pub(crate) fn decode_headers(raw: Headers) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(raw.len());
        for (name, value) in raw {
            let name = HeaderName::from_bytes(name.as_bytes())
                .or_err(InvalidIndex, "bad header name in cache meta")?;
            let value =
                HeaderValue::from_bytes(&value).or_err(InvalidIndex, "bad header value in cache meta")?;
            headers.append(name, value);
        }
        Ok(headers)
    }
}

use internal_meta::{decode_headers, encode_headers, MetaV1};

/// The decoded metadata of an index row
#[derive(Debug, Clone)]
pub struct StoredMeta {
    pub url: String,
    pub status: StatusCode,
    /// The request headers named by the response's `Vary`, plus `host`
    pub req_headers: HeaderMap,
    /// The subset of response headers that is replayed
    pub res_headers: HeaderMap,
    pub options: MetaOptions,
}

impl StoredMeta {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let raw = MetaV1 {
            version: MetaV1::VERSION,
            url: self.url.clone(),
            status: self.status.as_u16(),
            req_headers: encode_headers(&self.req_headers),
            res_headers: encode_headers(&self.res_headers),
            options: self.options.clone(),
        };
        rmp_serde::encode::to_vec_named(&raw).or_err(InternalError, "failed to encode cache meta")
    }

    /// Decode, failing on anything that is not the current layout
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let raw: MetaV1 =
            rmp_serde::decode::from_slice(buf).or_err(InvalidIndex, "failed to decode cache meta")?;
        if raw.version != MetaV1::VERSION {
            return Error::e_explain(
                InvalidIndex,
                format!("unknown cache meta version {}", raw.version),
            );
        }
        Ok(StoredMeta {
            url: raw.url,
            status: StatusCode::from_u16(raw.status)
                .or_err(InvalidIndex, "bad status in cache meta")?,
            req_headers: decode_headers(raw.req_headers)?,
            res_headers: decode_headers(raw.res_headers)?,
            options: raw.options,
        })
    }

    /// The metadata of `entry`, error for deletion markers and legacy rows
    pub fn from_entry(entry: &IndexEntry) -> Result<Self> {
        let buf = entry
            .metadata
            .as_deref()
            .or_err(InvalidIndex, "index row without metadata")?;
        Self::deserialize(buf)
    }

    /// Build the metadata to write for a response
    pub fn new(
        url: &Url,
        req_headers: &HeaderMap,
        status: StatusCode,
        res_headers: &HeaderMap,
        options: MetaOptions,
        additional: &[HeaderName],
    ) -> Self {
        StoredMeta {
            url: url.to_string(),
            status,
            req_headers: keep_request_headers(url, req_headers, res_headers),
            res_headers: keep_response_headers(res_headers, options.compress, additional),
            options,
        }
    }

    /// The `Location` of a cached redirect
    pub fn location(&self) -> Option<&str> {
        self.res_headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
    }
}

/// The request headers to record: those the response varies on, plus `host`
pub fn keep_request_headers(url: &Url, req: &HeaderMap, res: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::new();
    if let Some(names) = vary_header_names(res) {
        for name in names {
            for value in req.get_all(&name) {
                kept.append(name.clone(), value.clone());
            }
        }
    }
    if let Some(host) = url.host_str() {
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            kept.insert(header::HOST, value);
        }
    }
    kept
}

/// The response headers to record
///
/// With `compress` the body is stored decoded, so its encoding and length do not describe it
/// anymore.
pub fn keep_response_headers(
    res: &HeaderMap,
    compress: bool,
    additional: &[HeaderName],
) -> HeaderMap {
    let encoded = res.contains_key(header::CONTENT_ENCODING);
    let mut kept = HeaderMap::new();
    let mut copy = |name: &HeaderName| {
        for value in res.get_all(name) {
            kept.append(name.clone(), value.clone());
        }
    };
    for name in KEEP_RESPONSE_HEADERS.iter().chain(additional.iter()) {
        if compress && encoded && *name == header::CONTENT_LENGTH {
            continue;
        }
        copy(name);
    }
    if !compress {
        copy(&header::CONTENT_ENCODING);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.append(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn test_serde() {
        let url = Url::parse("https://registry.test:8443/pkg").unwrap();
        let req = headers(&[("accept", "application/json"), ("authorization", "secret")]);
        let res = headers(&[
            ("vary", "Accept"),
            ("etag", "\"x\""),
            ("set-cookie", "a=b"),
            ("warning", "199 - \"a\""),
            ("warning", "299 - \"b\""),
        ]);
        let meta = StoredMeta::new(
            &url,
            &req,
            StatusCode::OK,
            &res,
            MetaOptions::default(),
            &[],
        );
        let decoded = StoredMeta::deserialize(&meta.serialize().unwrap()).unwrap();

        assert_eq!(decoded.url, "https://registry.test:8443/pkg");
        assert_eq!(decoded.status, StatusCode::OK);
        assert_eq!(decoded.req_headers["accept"], "application/json");
        assert_eq!(decoded.req_headers["host"], "registry.test:8443");
        assert!(!decoded.req_headers.contains_key("authorization"));
        assert_eq!(decoded.res_headers["etag"], "\"x\"");
        assert!(!decoded.res_headers.contains_key("set-cookie"));
        assert_eq!(decoded.res_headers.get_all("warning").iter().count(), 2);
        assert_eq!(decoded.options, MetaOptions::default());
    }

    #[test]
    fn test_compress_flag() {
        let res = headers(&[
            ("content-encoding", "gzip"),
            ("content-length", "10"),
            ("content-type", "text/plain"),
        ]);
        let decoded = keep_response_headers(&res, true, &[]);
        assert!(!decoded.contains_key("content-encoding"));
        assert!(!decoded.contains_key("content-length"));
        assert_eq!(decoded["content-type"], "text/plain");

        let raw = keep_response_headers(&res, false, &[]);
        assert_eq!(raw["content-encoding"], "gzip");
        assert_eq!(raw["content-length"], "10");
    }

    #[test]
    fn test_additional_headers() {
        let res = headers(&[("x-foo", "bar"), ("x-other", "baz")]);
        let kept = keep_response_headers(&res, true, &[HeaderName::from_static("x-foo")]);
        assert_eq!(kept["x-foo"], "bar");
        assert!(!kept.contains_key("x-other"));
    }

    #[test]
    fn test_legacy_rows_rejected() {
        assert!(StoredMeta::deserialize(b"not msgpack").is_err());
        let legacy = rmp_serde::encode::to_vec_named(&("https://x.test/", 200)).unwrap();
        assert!(StoredMeta::deserialize(&legacy).is_err());

        let deletion = IndexEntry::deletion("k");
        assert!(StoredMeta::from_entry(&deletion).is_err());
    }
}
