//! HTTP/1.x wire codec
//!
//! Decodes a byte stream into [`HttpObject`]s and encodes them back. Bodies
//! are always streamed: a head is followed by `Chunk`s and a terminating
//! `LastChunk`, whether the body is chunked, length-delimited or delimited by
//! connection close. The response decoder needs to know about outgoing HEAD
//! and CONNECT requests to frame bodyless responses correctly, so the encoder
//! records every request head it emits.

use super::message::{Headers, HttpObject, RequestHead, ResponseHead, Version};
use super::rewrite::is_chunked;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Maximum length of a request or status line.
pub const MAX_INITIAL_LINE: usize = 8192;
/// Maximum size of the header section.
pub const MAX_HEADER_BYTES: usize = 16384;
/// Largest body slice emitted as a single `Chunk`.
pub const MAX_CHUNK: usize = 16384;

/// Which kind of initial message this decoder parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecSide {
    /// Client leg: parses requests.
    Requests,
    /// Server leg: parses responses.
    Responses,
}

#[derive(Debug)]
enum DecodeState {
    Head,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    ChunkTrailer,
    UntilClose,
    EmitLastChunk,
    /// Parsing is suspended; bytes accumulate untouched. Entered after a
    /// CONNECT request (or a 2xx CONNECT response) because what follows is
    /// not HTTP until the peer decides between tunneling and a retry.
    Hold,
    Tunnel,
}

struct OutgoingHint {
    head_request: bool,
    connect: bool,
}

pub struct HttpDecoder {
    side: CodecSide,
    state: DecodeState,
    hints: VecDeque<OutgoingHint>,
}

impl HttpDecoder {
    pub fn new(side: CodecSide) -> Self {
        HttpDecoder {
            side,
            state: DecodeState::Head,
            hints: VecDeque::new(),
        }
    }

    /// Called by the encoder half for every request written out, so that
    /// bodyless responses (HEAD, CONNECT 2xx) are framed correctly.
    pub fn record_outgoing(&mut self, request: &RequestHead) {
        if self.side == CodecSide::Responses {
            self.hints.push_back(OutgoingHint {
                head_request: request.is_head(),
                connect: request.is_connect(),
            });
        }
    }

    /// Switch to raw tunneling; buffered bytes drain as `Raw`.
    pub fn set_tunneling(&mut self) {
        self.state = DecodeState::Tunnel;
    }

    /// Resume HTTP parsing after a held CONNECT was refused (407/502).
    pub fn set_http(&mut self) {
        self.state = DecodeState::Head;
    }

    /// Decode at most one object from `buf`. Returns `None` when more bytes
    /// are needed; callers drain in a loop.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>> {
        loop {
            match self.state {
                DecodeState::Head => {
                    let Some(end) = find_header_end(buf) else {
                        enforce_head_limits(buf)?;
                        return Ok(None);
                    };
                    let head = buf.split_to(end);
                    return match self.side {
                        CodecSide::Requests => self.decode_request_head(&head).map(Some),
                        CodecSide::Responses => self.decode_response_head(&head).map(Some),
                    };
                }
                DecodeState::FixedBody { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (remaining.min(buf.len() as u64) as usize).min(MAX_CHUNK);
                    let data = buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        DecodeState::EmitLastChunk
                    } else {
                        DecodeState::FixedBody { remaining }
                    };
                    return Ok(Some(HttpObject::Chunk(data)));
                }
                DecodeState::EmitLastChunk => {
                    self.state = DecodeState::Head;
                    return Ok(Some(HttpObject::LastChunk));
                }
                DecodeState::ChunkSize => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > 1024 {
                            return Err(Error::malformed("chunk size line too long"));
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    let text = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| Error::malformed("non-UTF8 chunk size line"))?;
                    let size_text = text.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_text, 16)
                        .map_err(|_| Error::malformed(format!("bad chunk size: {}", size_text)))?;
                    self.state = if size == 0 {
                        DecodeState::ChunkTrailer
                    } else {
                        DecodeState::ChunkData { remaining: size }
                    };
                }
                DecodeState::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len()).min(MAX_CHUNK);
                    let data = buf.split_to(take).freeze();
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData { remaining }
                    };
                    return Ok(Some(HttpObject::Chunk(data)));
                }
                DecodeState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::malformed("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::ChunkTrailer => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_HEADER_BYTES {
                            return Err(Error::malformed("trailer section too large"));
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    if line_end == 0 {
                        // Empty line ends the trailers; discard any we saw.
                        self.state = DecodeState::Head;
                        return Ok(Some(HttpObject::LastChunk));
                    }
                }
                DecodeState::UntilClose => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = buf.len().min(MAX_CHUNK);
                    return Ok(Some(HttpObject::Chunk(buf.split_to(take).freeze())));
                }
                DecodeState::Hold => return Ok(None),
                DecodeState::Tunnel => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(HttpObject::Raw(buf.split().freeze())));
                }
            }
        }
    }

    /// End of stream: a close-delimited body completes here.
    pub fn on_eof(&mut self) -> Option<HttpObject> {
        if matches!(self.state, DecodeState::UntilClose) {
            self.state = DecodeState::Head;
            Some(HttpObject::LastChunk)
        } else {
            None
        }
    }

    fn decode_request_head(&mut self, head: &[u8]) -> Result<HttpObject> {
        let (first_line, header_lines) = split_head(head)?;
        let mut parts = first_line.split_whitespace();
        let (method, uri, version_text) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => {
                return Err(Error::malformed(format!(
                    "invalid request line: {:?}",
                    first_line
                )))
            }
        };
        let version = Version::parse(version_text)
            .ok_or_else(|| Error::malformed(format!("unsupported version: {}", version_text)))?;

        let mut request = RequestHead::new(method, uri, version);
        request.headers = parse_headers(header_lines)?;

        self.state = if request.is_connect() {
            DecodeState::Hold
        } else if is_chunked(&request.headers) {
            DecodeState::ChunkSize
        } else {
            match request.content_length() {
                Some(n) if n > 0 => DecodeState::FixedBody { remaining: n },
                _ => DecodeState::Head,
            }
        };
        Ok(HttpObject::Request(request))
    }

    fn decode_response_head(&mut self, head: &[u8]) -> Result<HttpObject> {
        let (first_line, header_lines) = split_head(head)?;
        let mut parts = first_line.splitn(3, ' ');
        let version_text = parts.next().unwrap_or("");
        let status_text = parts.next().unwrap_or("");
        let reason = parts.next().unwrap_or("").to_string();

        let version = Version::parse(version_text)
            .ok_or_else(|| Error::malformed(format!("unsupported version: {}", version_text)))?;
        let status: u16 = status_text
            .parse()
            .map_err(|_| Error::malformed(format!("bad status code: {:?}", status_text)))?;

        let mut response = ResponseHead::new(version, status, reason);
        response.headers = parse_headers(header_lines)?;

        let hint = self.hints.pop_front();
        let to_head_request = hint.as_ref().map(|h| h.head_request).unwrap_or(false);
        let to_connect = hint.as_ref().map(|h| h.connect).unwrap_or(false);

        self.state = if to_connect && response.is_success() {
            // What follows a CONNECT 2xx is the tunnel payload.
            DecodeState::Hold
        } else if to_head_request
            || response.status / 100 == 1
            || response.status == 204
            || response.status == 304
        {
            DecodeState::Head
        } else if is_chunked(&response.headers) {
            DecodeState::ChunkSize
        } else {
            match response.content_length() {
                Some(0) => DecodeState::Head,
                Some(n) => DecodeState::FixedBody { remaining: n },
                None => DecodeState::UntilClose,
            }
        };
        Ok(HttpObject::Response(response))
    }
}

/// Whether a decoded head announces body objects to follow. Drives the
/// AWAITING_CHUNK transition on both peers.
pub fn announces_body(object: &HttpObject) -> bool {
    match object {
        HttpObject::Request(head) => {
            !head.is_connect()
                && (is_chunked(&head.headers) || head.content_length().unwrap_or(0) > 0)
        }
        HttpObject::Response(head) => {
            if head.status / 100 == 1 || head.status == 204 || head.status == 304 {
                return false;
            }
            // Length-delimited, chunked and close-delimited bodies all stream
            is_chunked(&head.headers) || head.content_length() != Some(0)
        }
        _ => false,
    }
}

/// Encodes objects for the wire. Chunked framing is applied to body chunks
/// whenever the most recent head declared `Transfer-Encoding: chunked`.
pub struct HttpEncoder {
    chunked: bool,
}

impl HttpEncoder {
    pub fn new() -> Self {
        HttpEncoder { chunked: false }
    }

    pub fn encode(&mut self, object: &HttpObject, out: &mut BytesMut) {
        match object {
            HttpObject::Request(head) => {
                self.chunked = is_chunked(&head.headers);
                out.extend_from_slice(head.method.as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(head.uri.as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(head.version.as_str().as_bytes());
                out.extend_from_slice(b"\r\n");
                encode_headers(&head.headers, out);
            }
            HttpObject::Response(head) => {
                self.chunked = is_chunked(&head.headers);
                out.extend_from_slice(head.version.as_str().as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(head.status.to_string().as_bytes());
                out.extend_from_slice(b" ");
                out.extend_from_slice(head.reason.as_bytes());
                out.extend_from_slice(b"\r\n");
                encode_headers(&head.headers, out);
            }
            HttpObject::Chunk(data) => {
                if self.chunked {
                    out.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                    out.extend_from_slice(data);
                    out.extend_from_slice(b"\r\n");
                } else {
                    out.extend_from_slice(data);
                }
            }
            HttpObject::LastChunk => {
                if self.chunked {
                    out.extend_from_slice(b"0\r\n\r\n");
                    self.chunked = false;
                }
            }
            HttpObject::Raw(data) => out.extend_from_slice(data),
        }
    }
}

impl Default for HttpEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_headers(headers: &Headers, out: &mut BytesMut) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Offset one past the `\r\n\r\n` ending the head, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn enforce_head_limits(buf: &[u8]) -> Result<()> {
    match find_crlf(buf) {
        Some(line_end) if line_end > MAX_INITIAL_LINE => {
            Err(Error::malformed("initial line too long"))
        }
        None if buf.len() > MAX_INITIAL_LINE => Err(Error::malformed("initial line too long")),
        _ if buf.len() > MAX_INITIAL_LINE + MAX_HEADER_BYTES => {
            Err(Error::malformed("header section too large"))
        }
        _ => Ok(()),
    }
}

fn split_head(head: &[u8]) -> Result<(&str, std::str::Lines<'_>)> {
    let text = std::str::from_utf8(head).map_err(|_| Error::malformed("non-UTF8 header"))?;
    let mut lines = text.lines();
    let first = lines
        .next()
        .ok_or_else(|| Error::malformed("empty message head"))?;
    if first.len() > MAX_INITIAL_LINE {
        return Err(Error::malformed("initial line too long"));
    }
    Ok((first, lines))
}

fn parse_headers(lines: std::str::Lines<'_>) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut total = 0usize;
    for line in lines {
        if line.is_empty() {
            break;
        }
        total += line.len() + 2;
        if total > MAX_HEADER_BYTES {
            return Err(Error::malformed("header section too large"));
        }
        let Some(colon) = line.find(':') else {
            return Err(Error::malformed(format!("invalid header line: {:?}", line)));
        };
        headers.add(line[..colon].trim(), line[colon + 1..].trim());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut HttpDecoder, buf: &mut BytesMut) -> Vec<HttpObject> {
        let mut objects = Vec::new();
        while let Some(obj) = decoder.decode(buf).unwrap() {
            objects.push(obj);
        }
        objects
    }

    #[test]
    fn test_decode_simple_request() {
        let mut decoder = HttpDecoder::new(CodecSide::Requests);
        let mut buf = BytesMut::from(
            &b"GET http://example.org/a HTTP/1.1\r\nHost: example.org\r\n\r\n"[..],
        );
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 1);
        match &objects[0] {
            HttpObject::Request(req) => {
                assert_eq!(req.method, "GET");
                assert_eq!(req.uri, "http://example.org/a");
                assert_eq!(req.headers.get("Host"), Some("example.org"));
            }
            other => panic!("unexpected object: {:?}", other),
        }
    }

    #[test]
    fn test_decode_request_with_content_length_body() {
        let mut decoder = HttpDecoder::new(CodecSide::Requests);
        let mut buf =
            BytesMut::from(&b"POST /a HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"[..]);
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 3);
        assert!(matches!(objects[0], HttpObject::Request(_)));
        match &objects[1] {
            HttpObject::Chunk(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected object: {:?}", other),
        }
        assert!(objects[2].is_last_chunk());
    }

    #[test]
    fn test_decode_partial_head_needs_more() {
        let mut decoder = HttpDecoder::new(CodecSide::Requests);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: e"[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"xample.org\r\n\r\n");
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_decode_chunked_response() {
        let mut decoder = HttpDecoder::new(CodecSide::Responses);
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n3\r\nabc\r\n0\r\n\r\n"[..],
        );
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 4);
        assert!(matches!(objects[0], HttpObject::Response(_)));
        assert!(matches!(&objects[1], HttpObject::Chunk(d) if &d[..] == b"hello"));
        assert!(matches!(&objects[2], HttpObject::Chunk(d) if &d[..] == b"abc"));
        assert!(objects[3].is_last_chunk());
    }

    #[test]
    fn test_decode_chunked_with_trailers() {
        let mut decoder = HttpDecoder::new(CodecSide::Responses);
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nX-Sum: 1\r\n\r\n"[..],
        );
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 3);
        assert!(objects[2].is_last_chunk());
    }

    #[test]
    fn test_decode_close_delimited_response() {
        let mut decoder = HttpDecoder::new(CodecSide::Responses);
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\npartial"[..]);
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 2);
        assert!(matches!(&objects[1], HttpObject::Chunk(d) if &d[..] == b"partial"));
        assert!(matches!(decoder.on_eof(), Some(HttpObject::LastChunk)));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut decoder = HttpDecoder::new(CodecSide::Responses);
        decoder.record_outgoing(&RequestHead::new("HEAD", "/", Version::Http11));
        let mut buf =
            BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n"[..]);
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 1);
        assert!(matches!(objects[0], HttpObject::Response(_)));
    }

    #[test]
    fn test_connect_2xx_holds_then_tunnels() {
        let mut decoder = HttpDecoder::new(CodecSide::Responses);
        decoder.record_outgoing(&RequestHead::new(
            "CONNECT",
            "example.org:443",
            Version::Http11,
        ));
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\n\r\n\x16\x03\x01"[..]);
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 1);
        // TLS bytes are held, not parsed
        assert_eq!(buf.len(), 3);

        decoder.set_tunneling();
        let objects = drain(&mut decoder, &mut buf);
        assert!(matches!(&objects[0], HttpObject::Raw(d) if &d[..] == b"\x16\x03\x01"));
    }

    #[test]
    fn test_connect_request_holds_client_bytes() {
        let mut decoder = HttpDecoder::new(CodecSide::Requests);
        let mut buf = BytesMut::from(
            &b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n\x16\x03"[..],
        );
        let objects = drain(&mut decoder, &mut buf);
        assert_eq!(objects.len(), 1);
        assert_eq!(buf.len(), 2);

        // A refused CONNECT resumes HTTP parsing for the retry
        decoder.set_http();
        buf.clear();
        buf.extend_from_slice(b"GET / HTTP/1.1\r\nHost: e\r\n\r\n");
        let objects = drain(&mut decoder, &mut buf);
        assert!(matches!(objects[0], HttpObject::Request(_)));
    }

    #[test]
    fn test_oversized_initial_line_rejected() {
        let mut decoder = HttpDecoder::new(CodecSide::Requests);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"GET /");
        buf.extend_from_slice(&vec![b'a'; MAX_INITIAL_LINE + 10]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_large_chunk_is_split() {
        let mut decoder = HttpDecoder::new(CodecSide::Responses);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"HTTP/1.1 200 OK\r\nContent-Length: 20000\r\n\r\n");
        buf.extend_from_slice(&vec![b'x'; 20000]);
        let objects = drain(&mut decoder, &mut buf);
        // head + 16384 + 3616 + last chunk
        assert_eq!(objects.len(), 4);
        assert!(matches!(&objects[1], HttpObject::Chunk(d) if d.len() == MAX_CHUNK));
        assert!(objects[3].is_last_chunk());
    }

    #[test]
    fn test_encode_chunked_roundtrip_framing() {
        let mut encoder = HttpEncoder::new();
        let mut head = ResponseHead::new(Version::Http11, 200, "OK");
        head.headers.set("Transfer-Encoding", "chunked");

        let mut out = BytesMut::new();
        encoder.encode(&HttpObject::Response(head), &mut out);
        encoder.encode(&HttpObject::Chunk(Bytes::from_static(b"hello")), &mut out);
        encoder.encode(&HttpObject::LastChunk, &mut out);

        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("5\r\nhello\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn test_encode_plain_body_has_no_framing() {
        let mut encoder = HttpEncoder::new();
        let mut head = ResponseHead::new(Version::Http11, 200, "OK");
        head.headers.set("Content-Length", "2");

        let mut out = BytesMut::new();
        encoder.encode(&HttpObject::Response(head), &mut out);
        encoder.encode(&HttpObject::Chunk(Bytes::from_static(b"OK")), &mut out);
        encoder.encode(&HttpObject::LastChunk, &mut out);

        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.ends_with("\r\n\r\nOK"));
    }

    #[test]
    fn test_announces_body() {
        let get = RequestHead::new("GET", "/", Version::Http11);
        assert!(!announces_body(&HttpObject::Request(get)));

        let mut post = RequestHead::new("POST", "/", Version::Http11);
        post.headers.set("Transfer-Encoding", "chunked");
        assert!(announces_body(&HttpObject::Request(post)));

        let no_content = ResponseHead::new(Version::Http11, 204, "No Content");
        assert!(!announces_body(&HttpObject::Response(no_content)));

        let mut sized = ResponseHead::new(Version::Http11, 200, "OK");
        sized.headers.set("Content-Length", "2");
        assert!(announces_body(&HttpObject::Response(sized)));

        let mut empty = ResponseHead::new(Version::Http11, 200, "OK");
        empty.headers.set("Content-Length", "0");
        assert!(!announces_body(&HttpObject::Response(empty)));
    }
}
