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

//! A scripted origin that records what it is sent

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use stash::transport::{chunked_body, Transport, TransportOpts, TransportResponse};
use stash::Request;
use stash_error::{Error, ErrorType, Result};
use std::collections::{HashMap, VecDeque};

/// One scripted answer
#[derive(Debug, Clone)]
pub struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    content_length: bool,
    error: Option<ErrorType>,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Reply {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            content_length: true,
            error: None,
        }
    }

    pub fn ok(body: &str) -> Self {
        Self::new(200).body(body)
    }

    /// The request fails before any response, as if the network was down
    pub fn error(etype: ErrorType) -> Self {
        Reply {
            error: Some(etype),
            ..Self::new(200)
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = Bytes::copy_from_slice(body.as_bytes());
        self
    }

    /// Do not announce the body length
    pub fn chunked(mut self) -> Self {
        self.content_length = false;
        self
    }
}

/// What the origin was sent
#[derive(Debug, Clone)]
pub struct Sent {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

#[derive(Default)]
pub struct MockOrigin {
    replies: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    sent: Mutex<Vec<Sent>>,
}

impl MockOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for the next `method` request to `url`
    pub fn reply(&self, method: Method, url: &str, reply: Reply) {
        self.replies
            .lock()
            .entry((method, url.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn on_get(&self, url: &str, reply: Reply) {
        self.reply(Method::GET, url, reply)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn requests(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last(&self) -> Sent {
        self.sent.lock().last().cloned().expect("nothing was sent")
    }

    /// Whether every queued reply was used
    pub fn is_done(&self) -> bool {
        self.replies.lock().values().all(VecDeque::is_empty)
    }
}

#[async_trait]
impl Transport for MockOrigin {
    async fn send(&self, req: &Request, _opts: &TransportOpts) -> Result<TransportResponse> {
        let url = req.url.to_string();
        self.sent.lock().push(Sent {
            method: req.method.clone(),
            url: url.clone(),
            headers: req.headers.clone(),
        });
        let reply = self
            .replies
            .lock()
            .get_mut(&(req.method.clone(), url.clone()))
            .and_then(VecDeque::pop_front);
        let Some(reply) = reply else {
            return Err(Error::explain(
                ErrorType::ConnectRefused,
                format!("no reply scripted for {} {url}", req.method),
            )
            .into_up());
        };
        if let Some(etype) = reply.error {
            return Err(Error::explain(etype, format!("request to {url} failed")).into_up());
        }
        let mut headers = reply.headers;
        if reply.content_length && !headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(reply.body.len()));
        }
        // two chunks so bodies really stream
        let mid = reply.body.len() / 2;
        let chunks = vec![reply.body.slice(..mid), reply.body.slice(mid..)];
        Ok(TransportResponse::new(
            reply.status,
            headers,
            chunked_body(chunks),
        ))
    }
}
