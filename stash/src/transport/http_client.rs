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

//! A [Transport] over `reqwest`

use super::{BodyStream, Request, Transport, TransportOpts, TransportResponse};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use log::{debug, warn};
use stash_error::{Error, ErrorType, ErrorType::*, OrErr, Result};
use std::time::Duration;

/// Sends requests with a `reqwest` client, one hop at a time
///
/// Redirects are never followed here. Failed attempts are retried per
/// [TransportOpts::retry](super::TransportOpts).
pub struct ReqwestTransport {
    // negotiates and decodes content encodings
    decoding: reqwest::Client,
    // hands bodies over as the origin encoded them
    raw: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let build = |gzip: bool| {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(timeout)
                .gzip(gzip)
                .build()
                .or_err(InternalError, "failed to build http client")
        };
        Ok(ReqwestTransport {
            decoding: build(true)?,
            raw: build(false)?,
        })
    }

    async fn send_once(&self, req: &Request, opts: &TransportOpts) -> Result<TransportResponse> {
        let client = if opts.compress {
            &self.decoding
        } else {
            &self.raw
        };
        let mut builder = client
            .request(req.method.clone(), req.url.clone())
            .headers(req.headers.clone());
        if let Some(body) = req.body.clone() {
            builder = builder.body(body);
        }
        let res = builder.send().await.map_err(|e| transport_error(e, &req.url))?;
        let status = res.status();
        let headers = res.headers().clone();
        let url = req.url.to_string();
        let body: BodyStream = res
            .bytes_stream()
            .map_err(move |e| transport_error(e, &url))
            .boxed();
        Ok(TransportResponse::new(status, headers, body))
    }
}

fn transport_error(e: reqwest::Error, url: &impl std::fmt::Display) -> Box<Error> {
    let etype: ErrorType = if e.is_timeout() {
        if e.is_connect() {
            ConnectTimedout
        } else {
            ReadTimedout
        }
    } else if e.is_connect() {
        ConnectError
    } else if e.is_body() || e.is_decode() {
        ReadError
    } else if e.is_request() {
        WriteError
    } else {
        UnknownError
    };
    Error::because(etype, format!("request to {url} failed"), e).into_up()
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: &Request, opts: &TransportOpts) -> Result<TransportResponse> {
        let mut attempt = 0;
        loop {
            match self.send_once(req, opts).await {
                Ok(res) => return Ok(res),
                Err(e) if e.retry() && attempt < opts.retry.retries => {
                    let wait = opts.retry.backoff(attempt);
                    warn!(
                        "{} {} failed, retrying in {wait:?} ({}/{}): {e}",
                        req.method,
                        req.url,
                        attempt + 1,
                        opts.retry.retries
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{} {} failed: {e}", req.method, req.url);
                    return Err(e);
                }
            }
        }
    }
}
