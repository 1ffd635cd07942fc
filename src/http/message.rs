//! Typed HTTP/1.x message model
//!
//! Messages flow through the proxy as a head followed by zero or more body
//! chunks and a terminating last-chunk marker. Raw buffers carry tunneled
//! bytes once a connection stops speaking HTTP.

use bytes::Bytes;
use std::fmt;

/// HTTP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    pub fn parse(s: &str) -> Option<Version> {
        match s {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, case-insensitive multimap of header fields.
///
/// Insertion order is preserved on the wire; lookups ignore case.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace all values of `name` with a single value.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// Append a value without touching existing ones.
    pub fn add<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.fields.push((name.into(), value.into()));
    }

    /// Remove all values of `name`; returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before != self.fields.len()
    }

    /// Distinct field names, in first-appearance order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (k, _) in &self.fields {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(k)) {
                names.push(k.clone());
            }
        }
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn wire_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(k, v)| k.len() + v.len() + 4)
            .sum()
    }
}

/// Request line plus headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    pub fn new<M: Into<String>, U: Into<String>>(method: M, uri: U, version: Version) -> Self {
        RequestHead {
            method: method.into(),
            uri: uri.into(),
            version,
            headers: Headers::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }
}

impl fmt::Display for RequestHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.uri, self.version)
    }
}

/// Status line plus headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new<R: Into<String>>(version: Version, status: u16, reason: R) -> Self {
        ResponseHead {
            version,
            status,
            reason: reason.into(),
            headers: Headers::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }
}

impl fmt::Display for ResponseHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.version, self.status, self.reason)
    }
}

/// One unit of traffic through a peer connection.
#[derive(Debug, Clone)]
pub enum HttpObject {
    Request(RequestHead),
    Response(ResponseHead),
    Chunk(Bytes),
    /// End-of-body marker; trailers are consumed and discarded by the codec.
    LastChunk,
    /// Opaque bytes while tunneling.
    Raw(Bytes),
}

impl HttpObject {
    pub fn is_last_chunk(&self) -> bool {
        matches!(self, HttpObject::LastChunk)
    }

    /// Approximate on-wire size, used for write watermark accounting and
    /// byte-level activity tracking.
    pub fn wire_size(&self) -> usize {
        match self {
            HttpObject::Request(head) => {
                head.method.len() + head.uri.len() + 12 + head.headers.wire_size()
            }
            HttpObject::Response(head) => head.reason.len() + 15 + head.headers.wire_size(),
            HttpObject::Chunk(data) => data.len(),
            HttpObject::LastChunk => 5,
            HttpObject::Raw(data) => data.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/html");
        assert_eq!(h.get("content-type"), Some("text/html"));
        assert!(h.contains("CONTENT-TYPE"));
    }

    #[test]
    fn test_headers_set_replaces_all() {
        let mut h = Headers::new();
        h.add("Via", "1.1 a");
        h.add("via", "1.1 b");
        h.set("Via", "1.1 c");
        assert_eq!(h.get_all("via").count(), 1);
        assert_eq!(h.get("Via"), Some("1.1 c"));
    }

    #[test]
    fn test_headers_remove() {
        let mut h = Headers::new();
        h.add("Connection", "keep-alive");
        assert!(h.remove("connection"));
        assert!(!h.remove("connection"));
        assert!(h.is_empty());
    }

    #[test]
    fn test_request_predicates() {
        let req = RequestHead::new("CONNECT", "example.org:443", Version::Http11);
        assert!(req.is_connect());
        assert!(!req.is_head());

        let mut get = RequestHead::new("GET", "/", Version::Http11);
        get.headers.set("Content-Length", "42");
        assert_eq!(get.content_length(), Some(42));
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::Http11));
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::Http10));
        assert_eq!(Version::parse("HTTP/2"), None);
    }
}
