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

#![allow(unused)]

pub mod mock_origin;

use mock_origin::MockOrigin;
use stash::{CacheConf, FetchClient, FetchOptions, Request, Response};
use stash_store::MemStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub const HOST: &str = "https://registry.test";
pub const CONTENT: &str = "hello, world!";

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn url(path: &str) -> String {
    format!("{HOST}{path}")
}

/// A client over an in memory store, with the store and the origin it talks to
pub fn client() -> (FetchClient, Arc<MemStore>, Arc<MockOrigin>) {
    init();
    let store = Arc::new(MemStore::new());
    let origin = Arc::new(MockOrigin::new());
    let client = FetchClient::new(store.clone(), origin.clone(), CacheConf::default());
    (client, store, origin)
}

pub async fn get(client: &FetchClient, path: &str) -> Response {
    get_with(client, path, FetchOptions::new()).await
}

pub async fn get_with(client: &FetchClient, path: &str, opts: FetchOptions) -> Response {
    client
        .fetch(Request::get(&url(path)).unwrap(), opts)
        .await
        .unwrap()
}

pub fn cache_status(res: &Response) -> &str {
    res.headers()["x-local-cache-status"].to_str().unwrap()
}

/// An http date `secs` seconds ago
pub fn ago(secs: u64) -> String {
    httpdate::fmt_http_date(SystemTime::now() - Duration::from_secs(secs))
}

/// An http date `secs` seconds from now
pub fn from_now(secs: u64) -> String {
    httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(secs))
}
