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

//! The fetch state machine
//!
//! Each request is dispatched on its [CacheMode]. A handler decides between the stored response
//! and the network, and how the answer of the network updates the store.

use crate::conf::CacheConf;
use crate::engine::{CacheEngine, CachedResponse};
use crate::key::CacheKey;
use crate::meta::{keep_response_headers, MetaOptions, StoredMeta};
use crate::options::{FetchOptions, ResolvedOptions};
use crate::pipeline::{Body, PipelineMode, Settled};
use crate::policy::{
    is_header_conditional, merge_not_modified, request_storable, response_storable,
    CachePolicy, RequestParts,
};
use crate::redirect::{is_redirect, next_request};
use crate::transport::{Request, Transport, TransportOpts, TransportResponse};
use crate::warning::{revalidation_failed, set_warning, strip_1xx, HEURISTIC_EXPIRATION};
use crate::{CacheMode, CacheStatus};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, LOCATION};
use http::{HeaderMap, Method, StatusCode};
use httpdate::fmt_http_date;
use log::{debug, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use stash_error::{Error, ErrorType, ErrorType::*, OrErr, Result};
use stash_store::{DiskStore, IndexEntry, Integrity, MemStore};
use std::sync::Arc;
use std::time::SystemTime;
use url::Url;

pub static X_LOCAL_CACHE: HeaderName = HeaderName::from_static("x-local-cache");
pub static X_LOCAL_CACHE_KEY: HeaderName = HeaderName::from_static("x-local-cache-key");
pub static X_LOCAL_CACHE_MODE: HeaderName = HeaderName::from_static("x-local-cache-mode");
pub static X_LOCAL_CACHE_STATUS: HeaderName = HeaderName::from_static("x-local-cache-status");
pub static X_LOCAL_CACHE_HASH: HeaderName = HeaderName::from_static("x-local-cache-hash");
pub static X_LOCAL_CACHE_TIME: HeaderName = HeaderName::from_static("x-local-cache-time");

const INVALID_BODY: ErrorType = ErrorType::new("InvalidBody");

// what encodeURIComponent leaves alone
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

fn encoded_value(s: &str) -> HeaderValue {
    let encoded = utf8_percent_encode(s, URI_COMPONENT).to_string();
    // percent encoded output is always a valid header value
    HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// A response to a fetch
pub struct Response {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    cache_status: CacheStatus,
    body: Body,
}

impl Response {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// How the cache produced this response, also in `x-local-cache-status`
    pub fn cache_status(&self) -> CacheStatus {
        self.cache_status
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Read the whole body
    pub async fn bytes(&mut self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Read the whole body as UTF-8
    pub async fn text(&mut self) -> Result<String> {
        let data = self.bytes().await?;
        String::from_utf8(data.to_vec()).or_err(INVALID_BODY, "response body is not UTF-8")
    }

    /// The integrity of the body, settled once it is read to the end
    pub fn integrity(&self) -> Settled<Integrity> {
        self.body.integrity()
    }

    /// The size of the body, settled once it is read to the end
    pub fn size(&self) -> Settled<u64> {
        self.body.size()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("cache_status", &self.cache_status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

// everything a mode handler needs about the request at hand
struct FetchCtx<'a> {
    req: &'a Request,
    opts: &'a ResolvedOptions,
    key: CacheKey,
    now: SystemTime,
}

impl FetchCtx<'_> {
    fn parts(&self) -> RequestParts<'_> {
        RequestParts {
            method: &self.req.method,
            headers: &self.req.headers,
        }
    }

    fn is_head(&self) -> bool {
        self.req.method == Method::HEAD
    }

    fn transport_opts(&self) -> TransportOpts {
        TransportOpts {
            retry: self.opts.retry.clone(),
            compress: self.opts.compress,
        }
    }
}

/// A fetch client with a cache in front of a [Transport]
///
/// Cloning is cheap, clones share the store and the transport.
#[derive(Clone)]
pub struct FetchClient {
    engine: CacheEngine,
    transport: Arc<dyn Transport>,
    conf: Arc<CacheConf>,
    defaults: FetchOptions,
}

impl FetchClient {
    pub fn new(
        store: Arc<dyn stash_store::ContentStore>,
        transport: Arc<dyn Transport>,
        conf: CacheConf,
    ) -> Self {
        FetchClient {
            engine: CacheEngine::new(store, &conf),
            transport,
            conf: Arc::new(conf),
            defaults: FetchOptions::default(),
        }
    }

    /// A client storing under `conf.cache_path`, or in memory without one
    pub fn from_conf(conf: CacheConf, transport: Arc<dyn Transport>) -> Result<Self> {
        let conf = conf.validate()?;
        let store: Arc<dyn stash_store::ContentStore> = match conf.cache_path.as_ref() {
            Some(path) => Arc::new(DiskStore::new(path.clone())),
            None => Arc::new(MemStore::new()),
        };
        info!("cache at {}", store.location());
        Ok(Self::new(store, transport, conf))
    }

    /// A client whose fetches fall back to `defaults` for the options they leave unset
    ///
    /// Chaining merges: the options of the latest call win.
    pub fn defaults(&self, defaults: FetchOptions) -> Self {
        FetchClient {
            defaults: defaults.or(&self.defaults),
            ..self.clone()
        }
    }

    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }

    pub fn conf(&self) -> &CacheConf {
        &self.conf
    }

    /// Fetch `req`, following redirects per the options
    ///
    /// Resolves as soon as the response head is known. Failures of the body surface when it is
    /// read.
    pub async fn fetch(&self, req: Request, opts: FetchOptions) -> Result<Response> {
        let opts = opts.or(&self.defaults).resolve(&self.conf);
        let mut req = req;
        if !opts.compress && !req.headers.contains_key(ACCEPT_ENCODING) {
            req.headers
                .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }
        let mut hops = 0;
        loop {
            let res = self.fetch_once(&req, &opts).await?;
            let next = next_request(
                &req,
                res.status,
                &res.headers,
                opts.redirect,
                opts.follow,
                hops,
            )?;
            let Some(next) = next else {
                return Ok(res);
            };
            hops += 1;
            req = next;
        }
    }

    /// Invalidate whatever is stored for `url`
    pub async fn delete(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).or_err_with(InvalidUrl, || format!("invalid url {url}"))?;
        self.engine.invalidate(&CacheKey::for_url(&url)).await
    }

    /// Prune the index of `url`, return the rows kept
    pub async fn compact(&self, url: &str) -> Result<Vec<IndexEntry>> {
        let url = Url::parse(url).or_err_with(InvalidUrl, || format!("invalid url {url}"))?;
        self.engine.compact(&CacheKey::for_url(&url)).await
    }

    async fn fetch_once(&self, req: &Request, opts: &ResolvedOptions) -> Result<Response> {
        let ctx = FetchCtx {
            req,
            opts,
            key: CacheKey::for_request(&req.method, &req.url),
            now: SystemTime::now(),
        };
        if !matches!(req.method, Method::GET | Method::HEAD) {
            return self.unsafe_method(&ctx).await;
        }
        debug!("{} {} in mode {}", req.method, req.url, opts.cache);
        match opts.cache {
            CacheMode::Default => self.default_mode(&ctx).await,
            CacheMode::NoStore => self.no_store(&ctx).await,
            CacheMode::Reload => self.reload(&ctx).await,
            CacheMode::NoCache => self.no_cache(&ctx).await,
            CacheMode::ForceCache => self.force_cache(&ctx).await,
            CacheMode::OnlyIfCached => self.only_if_cached(&ctx).await,
        }
    }

    async fn lookup(&self, ctx: &FetchCtx<'_>) -> Option<(CachedResponse, CachePolicy)> {
        let cached = self
            .engine
            .lookup(&ctx.key, ctx.req, ctx.opts.integrity.as_ref())
            .await?;
        let policy = cached.policy(ctx.req, ctx.now, self.engine.policy_conf());
        debug!(
            "found {}: fresh {}, age {:?}, ttl {:?}",
            ctx.key,
            policy.fresh(),
            policy.age(),
            policy.time_to_live()
        );
        Some((cached, policy))
    }

    async fn default_mode(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        match self.lookup(ctx).await {
            Some((cached, policy)) if policy.fresh() => {
                Ok(self.serve(ctx, &cached, &policy, CacheStatus::Hit))
            }
            Some((cached, policy)) => self.revalidate(ctx, cached, policy).await,
            None => self.fetch_remote(ctx, CacheStatus::Miss).await,
        }
    }

    async fn no_store(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        let res = self.send(ctx, ctx.req).await?;
        Ok(self.passthrough(ctx, res))
    }

    async fn reload(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        self.fetch_remote(ctx, CacheStatus::Miss).await
    }

    async fn no_cache(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        match self.lookup(ctx).await {
            Some((cached, policy)) => self.revalidate(ctx, cached, policy).await,
            None => self.fetch_remote(ctx, CacheStatus::Miss).await,
        }
    }

    async fn force_cache(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        match self.lookup(ctx).await {
            Some((cached, policy)) => {
                let status = if policy.fresh() {
                    CacheStatus::Hit
                } else {
                    CacheStatus::Stale
                };
                Ok(self.serve(ctx, &cached, &policy, status))
            }
            None => self.fetch_remote(ctx, CacheStatus::Miss).await,
        }
    }

    async fn only_if_cached(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        match self.lookup(ctx).await {
            Some((cached, policy)) => {
                let status = if policy.fresh() {
                    CacheStatus::Hit
                } else {
                    CacheStatus::Stale
                };
                Ok(self.serve(ctx, &cached, &policy, status))
            }
            None => Error::e_explain(
                NotCached,
                format!(
                    "request to {} failed: cache mode is 'only-if-cached' but no cached response is available",
                    ctx.req.url
                ),
            ),
        }
    }

    // methods that change the resource void what is stored for it
    async fn unsafe_method(&self, ctx: &FetchCtx<'_>) -> Result<Response> {
        let res = self.send(ctx, ctx.req).await?;
        if let Err(e) = self.engine.invalidate(&ctx.key).await {
            warn!("failed to invalidate {} after {}: {e}", ctx.key, ctx.req.method);
        }
        Ok(self.passthrough(ctx, res))
    }

    async fn send(&self, ctx: &FetchCtx<'_>, req: &Request) -> Result<TransportResponse> {
        self.transport.send(req, &ctx.transport_opts()).await
    }

    // the stored response, as is
    fn serve(
        &self,
        ctx: &FetchCtx<'_>,
        cached: &CachedResponse,
        policy: &CachePolicy,
        status: CacheStatus,
    ) -> Response {
        let mut headers = cached.meta.res_headers.clone();
        strip_1xx(&mut headers);
        if policy.heuristic_warning() {
            set_warning(
                &mut headers,
                HeaderValue::from_static(HEURISTIC_EXPIRATION),
                false,
            );
        }
        self.stored_response(ctx, cached, cached.meta.status, headers, status)
    }

    fn stored_response(
        &self,
        ctx: &FetchCtx<'_>,
        cached: &CachedResponse,
        status: StatusCode,
        mut headers: HeaderMap,
        cache_status: CacheStatus,
    ) -> Response {
        let body = match (ctx.is_head(), cached.integrity()) {
            (true, Some(integrity)) => Body::settled_empty(integrity.clone(), cached.entry.size),
            (true, None) => Body::empty(),
            (false, _) => self.engine.replay(cached),
        };
        self.cache_headers(&mut headers, &ctx.key, body.mode(), cache_status);
        if let Some(integrity) = cached.integrity() {
            headers.insert(
                X_LOCAL_CACHE_HASH.clone(),
                encoded_value(&integrity.to_string()),
            );
        }
        if let Ok(time) = HeaderValue::from_str(&fmt_http_date(cached.entry.write_time())) {
            headers.insert(X_LOCAL_CACHE_TIME.clone(), time);
        }
        debug!("{} served from cache: {cache_status}", ctx.key);
        Response {
            url: ctx.req.url.clone(),
            status,
            headers,
            cache_status,
            body,
        }
    }

    // the stored response standing in for an origin that failed to revalidate it
    fn serve_stale(
        &self,
        ctx: &FetchCtx<'_>,
        cached: &CachedResponse,
        policy: &CachePolicy,
    ) -> Response {
        let mut res = self.serve(ctx, cached, policy, CacheStatus::Stale);
        let host = ctx.req.url.host_str().unwrap_or_default();
        set_warning(&mut res.headers, revalidation_failed(host, ctx.now), false);
        res
    }

    async fn revalidate(
        &self,
        ctx: &FetchCtx<'_>,
        cached: CachedResponse,
        policy: CachePolicy,
    ) -> Result<Response> {
        if is_header_conditional(&ctx.req.headers) {
            // the caller revalidates by itself, hand it whatever the origin says
            let res = self.send(ctx, ctx.req).await?;
            return Ok(self.passthrough(ctx, res));
        }

        let mut conditional = ctx.req.clone();
        for (name, value) in policy.conditional_headers().iter() {
            conditional.headers.insert(name.clone(), value.clone());
        }
        let res = match self.send(ctx, &conditional).await {
            Ok(res) => res,
            Err(e) if policy.allow_stale_on_error() => {
                warn!("revalidating {} failed, serving stale: {e}", ctx.key);
                return Ok(self.serve_stale(ctx, &cached, &policy));
            }
            Err(e) => return Err(e),
        };

        if res.status.is_server_error() && policy.allow_stale_on_error() {
            warn!(
                "revalidating {} got {}, serving stale",
                ctx.key, res.status
            );
            return Ok(self.serve_stale(ctx, &cached, &policy));
        }

        if res.status == StatusCode::NOT_MODIFIED {
            return Ok(self.not_modified(ctx, cached, res).await);
        }
        if res.status.is_server_error() {
            // the stored response may not stand in for an error: void it
            if let Err(e) = self.engine.invalidate(&ctx.key).await {
                warn!("failed to invalidate {}: {e}", ctx.key);
            }
        }
        debug!("{} replaced by the origin with a {}", ctx.key, res.status);
        self.store_response(ctx, res, CacheStatus::Updated).await
    }

    async fn not_modified(
        &self,
        ctx: &FetchCtx<'_>,
        cached: CachedResponse,
        res: TransportResponse,
    ) -> Response {
        let merged = merge_not_modified(&cached.meta.res_headers, &res.headers);
        let meta = StoredMeta {
            res_headers: keep_response_headers(
                &merged,
                cached.meta.options.compress,
                &ctx.opts.cache_additional_headers,
            ),
            ..cached.meta.clone()
        };
        let storable = !ctx.is_head()
            && request_storable(&ctx.parts())
            && response_storable(meta.status, &meta.res_headers, self.engine.policy_conf().shared);
        let cached = if storable {
            let refreshed = self.engine.refresh(&cached, &meta).await;
            match refreshed {
                Ok(entry) => CachedResponse {
                    entry,
                    meta,
                    key: cached.key,
                },
                Err(e) => {
                    warn!("failed to refresh {}: {e}", ctx.key);
                    CachedResponse { meta, ..cached }
                }
            }
        } else {
            CachedResponse { meta, ..cached }
        };
        debug!("{} revalidated", ctx.key);
        let status = cached.meta.status;
        self.stored_response(ctx, &cached, status, merged, CacheStatus::Revalidated)
    }

    async fn fetch_remote(&self, ctx: &FetchCtx<'_>, status: CacheStatus) -> Result<Response> {
        let res = self.send(ctx, ctx.req).await?;
        self.store_response(ctx, res, status).await
    }

    // a network response, written to the store if it may be
    async fn store_response(
        &self,
        ctx: &FetchCtx<'_>,
        res: TransportResponse,
        status: CacheStatus,
    ) -> Result<Response> {
        // HEAD only reads what GET wrote
        if ctx.is_head() || !request_storable(&ctx.parts()) {
            return Ok(self.passthrough(ctx, res));
        }
        if !response_storable(res.status, &res.headers, self.engine.policy_conf().shared) {
            debug!("{} is not storable ({})", ctx.key, res.status);
            return Ok(self.network_response(ctx, res, CacheStatus::Miss));
        }

        let meta = StoredMeta::new(
            &ctx.req.url,
            &ctx.req.headers,
            res.status,
            &res.headers,
            MetaOptions {
                algorithms: ctx.opts.algorithms.clone(),
                compress: ctx.opts.compress,
            },
            &ctx.opts.cache_additional_headers,
        );

        if is_redirect(res.status) && res.headers.contains_key(LOCATION) {
            if let Err(e) = self.engine.store_redirect(&ctx.key, &meta).await {
                warn!("failed to cache redirect {}: {e}", ctx.key);
            }
            return Ok(self.network_response(ctx, res, status));
        }

        let content_length = res.content_length();
        let expected = ctx
            .opts
            .integrity
            .clone()
            .filter(|_| res.status.is_success());
        let TransportResponse {
            status: res_status,
            mut headers,
            body,
        } = res;
        let body = self
            .engine
            .tee(&ctx.key, &meta, body, content_length, expected)?;
        self.cache_headers(&mut headers, &ctx.key, body.mode(), status);
        Ok(Response {
            url: ctx.req.url.clone(),
            status: res_status,
            headers,
            cache_status: status,
            body,
        })
    }

    // a network response the store is not involved in
    fn passthrough(&self, ctx: &FetchCtx<'_>, res: TransportResponse) -> Response {
        self.network_response(ctx, res, CacheStatus::Skip)
    }

    fn network_response(
        &self,
        ctx: &FetchCtx<'_>,
        res: TransportResponse,
        cache_status: CacheStatus,
    ) -> Response {
        let expected = ctx
            .opts
            .integrity
            .clone()
            .filter(|_| res.status.is_success());
        let body = Body::passthrough(res.body, &ctx.opts.algorithms, expected);
        let mut headers = res.headers;
        self.cache_headers(&mut headers, &ctx.key, body.mode(), cache_status);
        Response {
            url: ctx.req.url.clone(),
            status: res.status,
            headers,
            cache_status,
            body,
        }
    }

    fn cache_headers(
        &self,
        headers: &mut HeaderMap,
        key: &CacheKey,
        mode: Option<PipelineMode>,
        status: CacheStatus,
    ) {
        headers.insert(X_LOCAL_CACHE.clone(), encoded_value(self.engine.location()));
        headers.insert(X_LOCAL_CACHE_KEY.clone(), encoded_value(key.as_str()));
        if let Some(mode) = mode {
            headers.insert(
                X_LOCAL_CACHE_MODE.clone(),
                HeaderValue::from_static(mode.as_str()),
            );
        }
        headers.insert(
            X_LOCAL_CACHE_STATUS.clone(),
            HeaderValue::from_static(status.as_str()),
        );
    }
}
