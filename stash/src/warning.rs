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

//! `Warning` header values (RFC 7234 section 5.5)

use http::header::WARNING;
use http::{HeaderMap, HeaderValue};
use httpdate::fmt_http_date;
use log::debug;
use std::time::SystemTime;

/// Attached when heuristic freshness served a response older than a day
pub const HEURISTIC_EXPIRATION: &str = "113 - \"heuristic expiration\"";

/// `111`: serving stale because revalidation failed
pub fn revalidation_failed(host: &str, now: SystemTime) -> HeaderValue {
    format_warning(111, host, "Revalidation failed", now)
}

/// `<code> <agent> "<text>" "<http-date>"`
pub fn format_warning(code: u16, agent: &str, text: &str, now: SystemTime) -> HeaderValue {
    let agent = if agent.is_empty() { "-" } else { agent };
    let value = format!(
        "{code} {agent} \"{}\" \"{}\"",
        text.replace('"', "\\\""),
        fmt_http_date(now)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|e| {
        debug!("unrepresentable warning {value:?}: {e}");
        HeaderValue::from_static("199 - \"warning\"")
    })
}

/// Add a warning, either on top of or instead of the existing ones
pub fn set_warning(headers: &mut HeaderMap, value: HeaderValue, replace: bool) {
    if replace {
        headers.insert(WARNING, value);
    } else {
        headers.append(WARNING, value);
    }
}

/// Drop `1xx` warnings, which only describe the freshness of the response they came with
pub fn strip_1xx(headers: &mut HeaderMap) {
    if !headers.contains_key(WARNING) {
        return;
    }
    let kept: Vec<HeaderValue> = headers
        .get_all(WARNING)
        .iter()
        .filter(|v| !v.as_bytes().starts_with(b"1"))
        .cloned()
        .collect();
    headers.remove(WARNING);
    for value in kept {
        headers.append(WARNING, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_format() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(784111777);
        assert_eq!(
            revalidation_failed("registry.test", t),
            "111 registry.test \"Revalidation failed\" \"Sun, 06 Nov 1994 08:49:37 GMT\""
        );
        assert_eq!(
            format_warning(199, "", "say \"hi\"", t),
            "199 - \"say \\\"hi\\\"\" \"Sun, 06 Nov 1994 08:49:37 GMT\""
        );
    }

    #[test]
    fn test_set_and_strip() {
        let mut h = HeaderMap::new();
        set_warning(&mut h, HeaderValue::from_static("199 localhost welp"), false);
        set_warning(&mut h, HeaderValue::from_static("214 localhost ok"), false);
        assert_eq!(h.get_all(WARNING).iter().count(), 2);
        strip_1xx(&mut h);
        assert_eq!(h[WARNING], "214 localhost ok");

        set_warning(&mut h, HeaderValue::from_static(HEURISTIC_EXPIRATION), true);
        assert_eq!(h.get_all(WARNING).iter().count(), 1);
        assert_eq!(h[WARNING], HEURISTIC_EXPIRATION);

        strip_1xx(&mut h);
        assert!(!h.contains_key(WARNING));
    }
}
