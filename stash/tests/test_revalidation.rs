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

mod utils;

use stash::{CacheMode, FetchOptions, Request, Response};
use stash_error::ErrorType;
use utils::mock_origin::Reply;
use utils::*;

const DAY: u64 = 24 * 3600;

fn stale(cache_control: &str) -> Reply {
    Reply::ok(CONTENT)
        .header("cache-control", cache_control)
        .header("age", "1000")
        .header("etag", "\"X\"")
}

fn warnings(res: &Response) -> Vec<String> {
    res.headers()
        .get_all("warning")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_revalidated_by_304() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("max-age=1"));
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(
        &url("/test"),
        Reply::new(304)
            .header("etag", "\"X\"")
            .header("cache-control", "max-age=300")
            .header("age", "0"),
    );
    let mut res = get(&client, "/test").await;
    assert_eq!(origin.last().headers["if-none-match"], "\"X\"");
    assert_eq!(res.status(), 200);
    assert_eq!(cache_status(&res), "revalidated");
    assert_eq!(res.headers()["cache-control"], "max-age=300");
    // the length of the empty 304 does not replace the stored one
    assert_eq!(res.headers()["content-length"], CONTENT.len().to_string());
    assert_eq!(res.text().await.unwrap(), CONTENT);

    // the refreshed headers made it fresh again
    let mut res = get(&client, "/test").await;
    assert_eq!(cache_status(&res), "hit");
    assert_eq!(res.text().await.unwrap(), CONTENT);
    assert_eq!(origin.requests(), 2);
    assert!(origin.is_done());
}

#[tokio::test]
async fn test_revalidation_updates() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("max-age=1"));
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(
        &url("/test"),
        Reply::ok("changed").header("cache-control", "max-age=300"),
    );
    let mut res = get(&client, "/test").await;
    assert_eq!(cache_status(&res), "updated");
    assert_eq!(res.text().await.unwrap(), "changed");

    let mut res = get(&client, "/test").await;
    assert_eq!(cache_status(&res), "hit");
    assert_eq!(res.text().await.unwrap(), "changed");
    assert_eq!(origin.requests(), 2);
}

#[tokio::test]
async fn test_stale_on_network_error() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("max-age=1"));
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(&url("/test"), Reply::error(ErrorType::ConnectRefused));
    let mut res = get(&client, "/test").await;
    assert_eq!(res.status(), 200);
    assert_eq!(cache_status(&res), "stale");
    let warnings = warnings(&res);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("111 registry.test \"Revalidation failed\" \""));
    assert_eq!(res.text().await.unwrap(), CONTENT);
}

#[tokio::test]
async fn test_must_revalidate_network_error() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("max-age=1, must-revalidate"));
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(&url("/test"), Reply::error(ErrorType::ConnectRefused));
    let err = client
        .fetch(Request::get(&url("/test")).unwrap(), FetchOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ECONNREFUSED"));
}

#[tokio::test]
async fn test_stale_on_server_error() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("max-age=1"));
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(&url("/test"), Reply::new(503).body("unavailable"));
    let mut res = get(&client, "/test").await;
    assert_eq!(res.status(), 200);
    assert_eq!(cache_status(&res), "stale");
    assert!(warnings(&res)[0].starts_with("111 "));
    assert_eq!(res.text().await.unwrap(), CONTENT);
}

#[tokio::test]
async fn test_server_error_invalidates() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("max-age=1, must-revalidate"));
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(&url("/test"), Reply::new(500).body("broken"));
    let mut res = get(&client, "/test").await;
    assert_eq!(res.status(), 500);
    assert_eq!(res.text().await.unwrap(), "broken");

    let err = client
        .fetch(
            Request::get(&url("/test")).unwrap(),
            FetchOptions::new().cache(CacheMode::OnlyIfCached),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ENOTCACHED"));
}

#[tokio::test]
async fn test_immutable() {
    let (client, _store, origin) = client();
    origin.on_get(&url("/test"), stale("immutable"));
    get(&client, "/test").await.bytes().await.unwrap();
    let res = get(&client, "/test").await;
    assert_eq!(cache_status(&res), "hit");
    assert_eq!(origin.requests(), 1);

    // no-cache still wins
    origin.on_get(&url("/other"), stale("immutable, no-cache"));
    get(&client, "/other").await.bytes().await.unwrap();
    origin.on_get(&url("/other"), Reply::new(304).header("etag", "\"X\""));
    let res = get(&client, "/other").await;
    assert_eq!(cache_status(&res), "revalidated");
    assert_eq!(origin.requests(), 3);
}

#[tokio::test]
async fn test_pragma_no_cache() {
    let (client, _store, origin) = client();
    origin.on_get(
        &url("/test"),
        Reply::ok(CONTENT)
            .header("cache-control", "max-age=300")
            .header("pragma", "no-cache")
            .header("etag", "\"X\""),
    );
    get(&client, "/test").await.bytes().await.unwrap();

    origin.on_get(&url("/test"), Reply::new(304).header("etag", "\"X\""));
    let mut res = get(&client, "/test").await;
    assert_eq!(cache_status(&res), "revalidated");
    assert_eq!(origin.last().headers["if-none-match"], "\"X\"");
    assert_eq!(res.text().await.unwrap(), CONTENT);
}

#[tokio::test]
async fn test_expires() {
    let (client, _store, origin) = client();
    origin.on_get(
        &url("/future"),
        Reply::ok(CONTENT)
            .header("date", &ago(0))
            .header("expires", &from_now(300)),
    );
    get(&client, "/future").await.bytes().await.unwrap();
    let res = get(&client, "/future").await;
    assert_eq!(cache_status(&res), "hit");

    origin.on_get(
        &url("/past"),
        Reply::ok(CONTENT)
            .header("date", &ago(0))
            .header("expires", &ago(60))
            .header("last-modified", &ago(DAY)),
    );
    get(&client, "/past").await.bytes().await.unwrap();
    origin.on_get(&url("/past"), Reply::new(304));
    let res = get(&client, "/past").await;
    assert_eq!(cache_status(&res), "revalidated");
    assert!(origin.last().headers.contains_key("if-modified-since"));
    assert_eq!(origin.requests(), 3);
}

#[tokio::test]
async fn test_heuristic_freshness_warning() {
    let (client, _store, origin) = client();
    // fresh for a tenth of 100 days, but already more than a day old
    origin.on_get(
        &url("/old"),
        Reply::ok(CONTENT)
            .header("date", &ago(0))
            .header("last-modified", &ago(100 * DAY))
            .header("age", "90000"),
    );
    get(&client, "/old").await.bytes().await.unwrap();
    let res = get(&client, "/old").await;
    assert_eq!(cache_status(&res), "hit");
    assert_eq!(warnings(&res), vec!["113 - \"heuristic expiration\""]);

    origin.on_get(
        &url("/young"),
        Reply::ok(CONTENT)
            .header("date", &ago(0))
            .header("last-modified", &ago(100 * DAY)),
    );
    get(&client, "/young").await.bytes().await.unwrap();
    let res = get(&client, "/young").await;
    assert_eq!(cache_status(&res), "hit");
    assert!(warnings(&res).is_empty());
    assert_eq!(origin.requests(), 2);
}

#[tokio::test]
async fn test_stored_1xx_warnings_dropped() {
    let (client, _store, origin) = client();
    origin.on_get(
        &url("/test"),
        Reply::ok(CONTENT)
            .header("cache-control", "max-age=300")
            .header("warning", "199 - \"misc\"")
            .header("warning", "214 - \"transformed\""),
    );
    let mut res = get(&client, "/test").await;
    assert_eq!(warnings(&res).len(), 2);
    res.bytes().await.unwrap();

    let res = get(&client, "/test").await;
    assert_eq!(cache_status(&res), "hit");
    assert_eq!(warnings(&res), vec!["214 - \"transformed\""]);
}
