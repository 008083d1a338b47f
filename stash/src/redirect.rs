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

//! Following redirects

use crate::options::RedirectMode;
use crate::transport::Request;

use http::header::{self, HeaderMap, HeaderName};
use http::{Method, StatusCode};
use log::debug;
use stash_error::{Error, ErrorType::*, OrErr, Result};

// dropped when a redirect leaves the host they were meant for
static CREDENTIAL_HEADERS: [HeaderName; 2] = [header::AUTHORIZATION, header::COOKIE];

// describe a body that is not sent anymore once the request turns into a GET
static BODY_HEADERS: [HeaderName; 3] = [
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::CONTENT_ENCODING,
];

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

// the method the next hop is sent with
fn next_method(method: &Method, status: StatusCode) -> Method {
    match status.as_u16() {
        303 if method != Method::HEAD => Method::GET,
        301 | 302 if method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

/// The request of the next hop, `None` when `status` and `headers` end the chain
///
/// `hops` is the number of redirects already followed for this fetch.
pub fn next_request(
    req: &Request,
    status: StatusCode,
    headers: &HeaderMap,
    mode: RedirectMode,
    follow: usize,
    hops: usize,
) -> Result<Option<Request>> {
    if !is_redirect(status) {
        return Ok(None);
    }
    let Some(location) = headers.get(header::LOCATION) else {
        return Ok(None);
    };
    match mode {
        RedirectMode::Manual => return Ok(None),
        RedirectMode::Error => {
            return Error::e_explain(
                RedirectForbidden,
                format!("redirect mode is set to error: {}", req.url),
            )
        }
        RedirectMode::Follow => {}
    }
    if hops >= follow {
        return Error::e_explain(
            TooManyRedirects,
            format!("maximum redirect reached at: {}", req.url),
        );
    }

    let location = location
        .to_str()
        .or_err_with(InvalidRedirect, || format!("bad Location from {}", req.url))?;
    let url = req
        .url
        .join(location)
        .or_err_with(InvalidRedirect, || {
            format!("invalid redirect {location} from {}", req.url)
        })?;

    let method = next_method(&req.method, status);
    let mut next = Request {
        method,
        url,
        headers: req.headers.clone(),
        body: req.body.clone(),
    };
    if next.method != req.method && next.method == Method::GET {
        next.body = None;
        for name in BODY_HEADERS.iter() {
            next.headers.remove(name);
        }
    }
    if next.url.host_str() != req.url.host_str() {
        for name in CREDENTIAL_HEADERS.iter() {
            next.headers.remove(name);
        }
    }
    debug!(
        "redirect {} {} -> {} {} ({status})",
        req.method, req.url, next.method, next.url
    );
    Ok(Some(next))
}
