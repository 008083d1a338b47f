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

//! The network side: requests, raw responses and the [Transport] that moves them
//!
//! A transport sends exactly one request. Redirects are followed by the caller, retries and
//! timeouts are the transport's business.

use crate::options::RetryConf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};
use stash_error::{ErrorType::*, OrErr, Result};
use url::Url;

#[cfg(feature = "reqwest")]
pub mod http_client;

/// A response body as it comes off the wire
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A body with no bytes
pub fn empty_body() -> BodyStream {
    stream::empty().boxed()
}

/// A body made of the given chunks
pub fn chunked_body<I>(chunks: I) -> BodyStream
where
    I: IntoIterator<Item = Bytes>,
    I::IntoIter: Send + 'static,
{
    stream::iter(chunks.into_iter().map(Ok)).boxed()
}

/// An outgoing request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url).or_err_with(InvalidUrl, || format!("invalid url {url}"))?;
        Ok(Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn head(url: &str) -> Result<Self> {
        Self::new(Method::HEAD, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Per request knobs passed down to the transport
#[derive(Debug, Clone, Default)]
pub struct TransportOpts {
    pub retry: RetryConf,
    /// Whether a content encoding may be negotiated and decoded
    pub compress: bool,
}

/// A response as the transport received it
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        TransportResponse {
            status,
            headers,
            body,
        }
    }

    /// The declared `Content-Length`, if any and valid
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Sends requests to origins
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and return as soon as the response head is in
    ///
    /// Network failures are returned as `Upstream` errors after the transport gave up retrying.
    async fn send(&self, req: &Request, opts: &TransportOpts) -> Result<TransportResponse>;
}
