//! Header and URI rewriting for proxied messages
//!
//! Implements the RFC 2616 proxy obligations: hop-by-hop scrubbing (13.5.1),
//! connection-token removal (14.10), `Via` bookkeeping (14.45) and `Date`
//! injection (14.18), plus the de-facto `Proxy-Connection` rename.

use super::message::{Headers, RequestHead, ResponseHead, Version};
use chrono::Utc;

/// Headers that never cross a hop boundary (RFC 2616 13.5.1).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Authority from the request-URI (absolute or authority form), falling back
/// to the `Host` header. Empty result means the request names no upstream.
pub fn parse_host_and_port(request: &RequestHead) -> Option<String> {
    let uri = request.uri.as_str();
    let without_scheme = match uri.find("://") {
        Some(idx) => &uri[idx + 3..],
        None => uri,
    };
    let candidate = without_scheme.split('/').next().unwrap_or("");

    if !candidate.is_empty() {
        return Some(candidate.to_string());
    }

    request
        .headers
        .get("Host")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

/// Reduce an absolute-form URI to origin form (`/path?query`).
pub fn strip_host(uri: &str) -> String {
    let Some(idx) = uri.find("://") else {
        return uri.to_string();
    };
    match uri[idx + 3..].find('/') {
        Some(slash) => uri[idx + 3 + slash..].to_string(),
        None => "/".to_string(),
    }
}

/// True iff `Transfer-Encoding` contains the `chunked` token.
pub fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("Transfer-Encoding")
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

/// Append `1.1 <alias>` to an existing `Via` or start one.
pub fn add_via(headers: &mut Headers, alias: &str) {
    let token = format!("1.1 {}", alias);
    match headers.get("Via") {
        Some(existing) => {
            let combined = format!("{}, {}", existing, token);
            headers.set("Via", combined);
        }
        None => headers.set("Via", token),
    }
}

/// Current time as an RFC 1123 HTTP-date in GMT.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// RFC 2616 14.10: remove every header named by a `Connection` token, then
/// drop the hop-by-hop set itself. Idempotent.
pub fn scrub_hop_by_hop(headers: &mut Headers) {
    let tokens: Vec<String> = headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    for token in tokens {
        headers.remove(&token);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Remove the `sdch` token from `Accept-Encoding`; we cannot decode it.
pub fn remove_sdch(headers: &mut Headers) {
    if let Some(ae) = headers.get("Accept-Encoding") {
        if ae.to_ascii_lowercase().contains("sdch") {
            let cleaned: Vec<&str> = ae
                .split(',')
                .map(str::trim)
                .filter(|t| !t.eq_ignore_ascii_case("sdch") && !t.is_empty())
                .collect();
            headers.set("Accept-Encoding", cleaned.join(", "));
        }
    }
}

/// The de-facto standard `Proxy-Connection` becomes `Connection` on the way
/// upstream, value preserved.
pub fn switch_proxy_connection(headers: &mut Headers) {
    if let Some(value) = headers.get("Proxy-Connection").map(str::to_string) {
        headers.remove("Proxy-Connection");
        headers.set("Connection", value);
    }
}

/// First phase of outbound request rewriting: URI reduction for direct
/// connections, `sdch` removal and the hop-by-hop scrub. The request filter
/// runs between this and [`finish_request_rewrite`] so that any hop-by-hop
/// header a filter introduces can be scrubbed again before the proxy attaches
/// its own `Connection` and `Via`.
pub fn rewrite_request(request: &mut RequestHead, chained: bool) {
    if !chained {
        request.uri = strip_host(&request.uri);
    }
    remove_sdch(&mut request.headers);
    scrub_hop_by_hop(&mut request.headers);
}

/// Second phase: rename `Proxy-Connection` and append our `Via`.
pub fn finish_request_rewrite(request: &mut RequestHead, alias: &str) {
    switch_proxy_connection(&mut request.headers);
    add_via(&mut request.headers, alias);
}

/// Rewrite a response head on its way back to the client: scrub, append
/// `Via`, and supply a `Date` when the origin omitted one (RFC 2616 14.18).
pub fn rewrite_response(response: &mut ResponseHead, alias: &str) {
    scrub_hop_by_hop(&mut response.headers);
    add_via(&mut response.headers, alias);
    if !response.headers.contains("Date") {
        response.headers.set("Date", http_date());
    }
}

/// Chunked encoding is an HTTP/1.1 feature, but some origins report 1.0 on a
/// chunked response. Upgrade the stated version so the client parses it.
pub fn fix_version_for_chunked(response: &mut ResponseHead) {
    if is_chunked(&response.headers) && response.version != Version::Http11 {
        response.version = Version::Http11;
    }
}

fn connection_says_close(headers: &Headers, name: &str) -> Option<bool> {
    let mut saw_keep_alive = false;
    let mut saw_close = false;
    for value in headers.get_all(name) {
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                saw_close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                saw_keep_alive = true;
            }
        }
    }
    if saw_close {
        Some(true)
    } else if saw_keep_alive {
        Some(false)
    } else {
        None
    }
}

/// Keep-alive semantics of a request for its HTTP version. `Proxy-Connection`
/// is honored as a synonym for `Connection` on the client leg.
pub fn is_keep_alive_request(request: &RequestHead) -> bool {
    if let Some(close) = connection_says_close(&request.headers, "Connection")
        .or_else(|| connection_says_close(&request.headers, "Proxy-Connection"))
    {
        return !close;
    }
    request.version == Version::Http11
}

/// Keep-alive semantics of a response for its HTTP version.
pub fn is_keep_alive_response(response: &ResponseHead) -> bool {
    if let Some(close) = connection_says_close(&response.headers, "Connection") {
        return !close;
    }
    response.version == Version::Http11
}

/// Mid-stream objects never trigger a close; on completion the client leg
/// closes when the request was not keep-alive.
pub fn should_close_client(request: &RequestHead, response: &ResponseHead, last: bool) -> bool {
    if is_chunked(&response.headers) && !last {
        return false;
    }
    !is_keep_alive_request(request)
}

/// The server leg also honors `Connection: close` from the origin, without
/// forcing the client leg shut.
pub fn should_close_server(request: &RequestHead, response: &ResponseHead, last: bool) -> bool {
    if is_chunked(&response.headers) && !last {
        return false;
    }
    !is_keep_alive_request(request) || !is_keep_alive_response(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, uri: &str) -> RequestHead {
        RequestHead::new(method, uri, Version::Http11)
    }

    #[test]
    fn test_parse_host_and_port_absolute_uri() {
        let req = request("GET", "http://example.org:8080/a/b");
        assert_eq!(
            parse_host_and_port(&req),
            Some("example.org:8080".to_string())
        );
    }

    #[test]
    fn test_parse_host_and_port_connect() {
        let req = request("CONNECT", "example.org:443");
        assert_eq!(
            parse_host_and_port(&req),
            Some("example.org:443".to_string())
        );
    }

    #[test]
    fn test_parse_host_and_port_host_header_fallback() {
        let mut req = request("GET", "/a");
        req.headers.set("Host", "example.org");
        assert_eq!(parse_host_and_port(&req), Some("example.org".to_string()));

        let bare = request("GET", "/a");
        assert_eq!(parse_host_and_port(&bare), None);
    }

    #[test]
    fn test_strip_host() {
        assert_eq!(strip_host("http://example.org/a?q=1"), "/a?q=1");
        assert_eq!(strip_host("http://example.org"), "/");
        assert_eq!(strip_host("/already/origin"), "/already/origin");
    }

    #[test]
    fn test_is_chunked() {
        let mut h = Headers::new();
        assert!(!is_chunked(&h));
        h.set("Transfer-Encoding", "gzip, Chunked");
        assert!(is_chunked(&h));
    }

    #[test]
    fn test_add_via_appends() {
        let mut h = Headers::new();
        add_via(&mut h, "alpha");
        assert_eq!(h.get("Via"), Some("1.1 alpha"));
        add_via(&mut h, "beta");
        assert_eq!(h.get("Via"), Some("1.1 alpha, 1.1 beta"));
    }

    #[test]
    fn test_via_associative_under_concatenation() {
        // (a then b) on top of nothing equals b applied to a's output
        let mut left = Headers::new();
        add_via(&mut left, "a");
        add_via(&mut left, "b");

        let mut right = Headers::new();
        right.set("Via", "1.1 a");
        add_via(&mut right, "b");

        assert_eq!(left.get("Via"), right.get("Via"));
    }

    #[test]
    fn test_scrub_removes_connection_tokens() {
        let mut h = Headers::new();
        h.set("Connection", "close, X-Tracing");
        h.set("X-Tracing", "on");
        h.set("Keep-Alive", "timeout=5");
        h.set("Content-Type", "text/plain");
        scrub_hop_by_hop(&mut h);
        assert!(!h.contains("Connection"));
        assert!(!h.contains("X-Tracing"));
        assert!(!h.contains("Keep-Alive"));
        assert!(h.contains("Content-Type"));
    }

    #[test]
    fn test_scrub_is_idempotent() {
        let mut h = Headers::new();
        h.set("Connection", "keep-alive");
        h.set("Upgrade", "websocket");
        h.set("Host", "example.org");
        scrub_hop_by_hop(&mut h);
        let snapshot: Vec<(String, String)> = h
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        scrub_hop_by_hop(&mut h);
        let again: Vec<(String, String)> = h
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_remove_sdch() {
        let mut h = Headers::new();
        h.set("Accept-Encoding", "gzip, sdch, br");
        remove_sdch(&mut h);
        assert_eq!(h.get("Accept-Encoding"), Some("gzip, br"));
    }

    #[test]
    fn test_switch_proxy_connection() {
        let mut h = Headers::new();
        h.set("Proxy-Connection", "keep-alive");
        switch_proxy_connection(&mut h);
        assert!(!h.contains("Proxy-Connection"));
        assert_eq!(h.get("Connection"), Some("keep-alive"));
    }

    #[test]
    fn test_full_request_rewrite_simple_get() {
        // Scenario: GET with absolute URI and Proxy-Connection, direct route
        let mut req = request("GET", "http://example.org/a");
        req.headers.set("Host", "example.org");
        req.headers.set("Proxy-Connection", "keep-alive");

        rewrite_request(&mut req, false);
        finish_request_rewrite(&mut req, "relay1");

        assert_eq!(req.uri, "/a");
        assert_eq!(req.headers.get("Host"), Some("example.org"));
        assert_eq!(req.headers.get("Connection"), Some("keep-alive"));
        assert_eq!(req.headers.get("Via"), Some("1.1 relay1"));
        assert!(!req.headers.contains("Proxy-Connection"));
    }

    #[test]
    fn test_chained_request_keeps_absolute_uri() {
        let mut req = request("GET", "http://example.org/a");
        rewrite_request(&mut req, true);
        assert_eq!(req.uri, "http://example.org/a");
    }

    #[test]
    fn test_response_rewrite_sets_date() {
        let mut resp = ResponseHead::new(Version::Http11, 200, "OK");
        resp.headers.set("Connection", "close");
        rewrite_response(&mut resp, "relay1");
        assert!(!resp.headers.contains("Connection"));
        assert!(resp.headers.contains("Date"));
        assert_eq!(resp.headers.get("Via"), Some("1.1 relay1"));
    }

    #[test]
    fn test_fix_version_for_chunked() {
        let mut resp = ResponseHead::new(Version::Http10, 200, "OK");
        resp.headers.set("Transfer-Encoding", "chunked");
        fix_version_for_chunked(&mut resp);
        assert_eq!(resp.version, Version::Http11);

        let mut plain = ResponseHead::new(Version::Http10, 200, "OK");
        fix_version_for_chunked(&mut plain);
        assert_eq!(plain.version, Version::Http10);
    }

    #[test]
    fn test_keep_alive_defaults_by_version() {
        let req11 = request("GET", "/");
        assert!(is_keep_alive_request(&req11));

        let req10 = RequestHead::new("GET", "/", Version::Http10);
        assert!(!is_keep_alive_request(&req10));

        let mut req10_ka = RequestHead::new("GET", "/", Version::Http10);
        req10_ka.headers.set("Proxy-Connection", "keep-alive");
        assert!(is_keep_alive_request(&req10_ka));
    }

    #[test]
    fn test_close_decisions() {
        let mut req = request("GET", "/");
        req.headers.set("Connection", "close");
        let resp = ResponseHead::new(Version::Http11, 200, "OK");

        assert!(should_close_client(&req, &resp, true));
        assert!(should_close_server(&req, &resp, true));

        let ka_req = request("GET", "/");
        let mut close_resp = ResponseHead::new(Version::Http11, 200, "OK");
        close_resp.headers.set("Connection", "close");
        assert!(!should_close_client(&ka_req, &close_resp, true));
        assert!(should_close_server(&ka_req, &close_resp, true));
    }

    #[test]
    fn test_mid_chunk_never_closes() {
        let mut req = request("GET", "/");
        req.headers.set("Connection", "close");
        let mut resp = ResponseHead::new(Version::Http11, 200, "OK");
        resp.headers.set("Transfer-Encoding", "chunked");

        assert!(!should_close_client(&req, &resp, false));
        assert!(!should_close_server(&req, &resp, false));
        assert!(should_close_client(&req, &resp, true));
    }

    #[test]
    fn test_http_date_shape() {
        let date = http_date();
        assert!(date.ends_with(" GMT"));
        // e.g. "Sun, 02 Aug 2026 12:00:00 GMT"
        assert_eq!(date.len(), 29);
    }
}
