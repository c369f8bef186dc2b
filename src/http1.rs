//! HTTP/1.x wire handling: message types, the framing decoder/encoder used
//! by [`crate::channel::Channel`], and the header/URI helpers shared by both
//! connection legs.
//!
//! Head parsing is delegated to `httparse`; body framing (content-length,
//! chunked, close-delimited) is tracked here so the rest of the proxy only
//! ever sees whole [`Frame`]s.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::error::ProxyError;

/// Initial request/status line limit.
pub const MAX_INITIAL_LINE: usize = 8192;
/// Header block limit (after the initial line).
pub const MAX_HEADER_BYTES: usize = 16384;
/// Largest body chunk handed upward in one frame. Bigger wire chunks are
/// split, never rejected.
pub const MAX_CHUNK_BYTES: usize = 16384;

const MAX_HEADER_COUNT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// The `major.minor` form used in `Via` entries.
    pub fn via_token(self) -> &'static str {
        match self {
            Version::Http10 => "1.0",
            Version::Http11 => "1.1",
        }
    }
}

/// Ordered header multimap. Order is preserved end-to-end so the proxy does
/// not reshuffle what it forwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Headers {
        Headers(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.push(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `name`'s comma-separated value list contains `token`
    /// (case-insensitive).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

impl<S: Into<String>, T: Into<String>> FromIterator<(S, T)> for Headers {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Headers {
        Headers(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl HttpRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &str) -> HttpResponse {
        HttpResponse {
            version: Version::Http11,
            status,
            reason: reason.to_string(),
            headers: Headers::new(),
        }
    }
}

/// One decoded unit off the wire. Heads carry `last = true` when no body
/// follows; bodies arrive as `Chunk`s with `last` marking end-of-message.
#[derive(Debug, Clone)]
pub enum Frame {
    Request { head: HttpRequest, last: bool },
    Response { head: HttpResponse, last: bool },
    Chunk { data: Bytes, last: bool },
    Raw(Bytes),
}

/// Which kind of head this side of the wire produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    Request,
    Response,
}

#[derive(Debug)]
enum BodyState {
    /// Between messages, waiting for a head.
    Head,
    Fixed { remaining: u64 },
    Chunked(ChunkState),
    /// Body runs until the peer closes (HTTP/1.0 style responses).
    UntilClose,
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailer,
}

#[derive(Debug)]
pub struct Decoder {
    mode: HttpMode,
    body: BodyState,
    tunneling: bool,
    /// The next response head has no body regardless of its headers
    /// (response to a HEAD request).
    headless_response: bool,
}

impl Decoder {
    pub fn new(mode: HttpMode) -> Decoder {
        Decoder {
            mode,
            body: BodyState::Head,
            tunneling: false,
            headless_response: false,
        }
    }

    /// Switch to raw pass-through. Any buffered bytes come out as
    /// [`Frame::Raw`] on the next decode call.
    pub fn start_tunneling(&mut self) {
        self.tunneling = true;
        self.body = BodyState::Head;
    }

    pub fn is_tunneling(&self) -> bool {
        self.tunneling
    }

    /// Tell the decoder the response to the in-flight request must not have
    /// a body (HEAD).
    pub fn expect_headless_response(&mut self) {
        self.headless_response = true;
    }

    /// Pull the next frame out of `buf`, or `None` when more bytes are
    /// needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        if self.tunneling {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Frame::Raw(buf.split().freeze())));
        }

        match &mut self.body {
            BodyState::Head => self.decode_head(buf),
            BodyState::Fixed { remaining } => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64).min(MAX_CHUNK_BYTES as u64);
                *remaining -= take;
                let last = *remaining == 0;
                if last {
                    self.body = BodyState::Head;
                }
                Ok(Some(Frame::Chunk {
                    data: buf.split_to(take as usize).freeze(),
                    last,
                }))
            }
            BodyState::Chunked(_) => self.decode_chunked(buf),
            BodyState::UntilClose => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = buf.len().min(MAX_CHUNK_BYTES);
                Ok(Some(Frame::Chunk {
                    data: buf.split_to(take).freeze(),
                    last: false,
                }))
            }
        }
    }

    /// The transport hit EOF. A close-delimited body ends here; returns the
    /// terminating frame if one is due.
    pub fn finish(&mut self) -> Option<Frame> {
        if matches!(self.body, BodyState::UntilClose) {
            self.body = BodyState::Head;
            return Some(Frame::Chunk {
                data: Bytes::new(),
                last: true,
            });
        }
        None
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        let Some(head_len) = find_head_end(buf)? else {
            return Ok(None);
        };
        let head = buf.split_to(head_len);

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        match self.mode {
            HttpMode::Request => {
                let mut parsed = httparse::Request::new(&mut slots);
                match parsed.parse(&head) {
                    Ok(httparse::Status::Complete(_)) => {}
                    Ok(httparse::Status::Partial) => {
                        return Err(ProxyError::MalformedMessage(
                            "incomplete request head".into(),
                        ))
                    }
                    Err(e) => return Err(ProxyError::MalformedMessage(e.to_string())),
                }
                let request = HttpRequest {
                    method: parsed.method.unwrap_or_default().to_string(),
                    uri: parsed.path.unwrap_or_default().to_string(),
                    version: version_from(parsed.version),
                    headers: collect_headers(parsed.headers),
                };
                let last = self.begin_request_body(&request);
                Ok(Some(Frame::Request {
                    head: request,
                    last,
                }))
            }
            HttpMode::Response => {
                let mut parsed = httparse::Response::new(&mut slots);
                match parsed.parse(&head) {
                    Ok(httparse::Status::Complete(_)) => {}
                    Ok(httparse::Status::Partial) => {
                        return Err(ProxyError::MalformedMessage(
                            "incomplete response head".into(),
                        ))
                    }
                    Err(e) => return Err(ProxyError::MalformedMessage(e.to_string())),
                }
                let response = HttpResponse {
                    version: version_from(parsed.version),
                    status: parsed.code.unwrap_or(0),
                    reason: parsed.reason.unwrap_or_default().to_string(),
                    headers: collect_headers(parsed.headers),
                };
                let last = self.begin_response_body(&response);
                Ok(Some(Frame::Response {
                    head: response,
                    last,
                }))
            }
        }
    }

    /// Work out the request's body framing; returns true when there is none.
    fn begin_request_body(&mut self, request: &HttpRequest) -> bool {
        if request.is_connect() {
            return true;
        }
        if is_chunked(&request.headers) {
            self.body = BodyState::Chunked(ChunkState::Size);
            return false;
        }
        match content_length(&request.headers) {
            Some(0) | None => true,
            Some(n) => {
                self.body = BodyState::Fixed { remaining: n };
                false
            }
        }
    }

    fn begin_response_body(&mut self, response: &HttpResponse) -> bool {
        let headless = std::mem::replace(&mut self.headless_response, false);
        if headless
            || (100..200).contains(&response.status)
            || response.status == 204
            || response.status == 304
        {
            return true;
        }
        if is_chunked(&response.headers) {
            self.body = BodyState::Chunked(ChunkState::Size);
            return false;
        }
        match content_length(&response.headers) {
            Some(0) => true,
            Some(n) => {
                self.body = BodyState::Fixed { remaining: n };
                false
            }
            None => {
                self.body = BodyState::UntilClose;
                false
            }
        }
    }

    fn decode_chunked(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        loop {
            let BodyState::Chunked(state) = &mut self.body else {
                unreachable!("decode_chunked outside chunked body");
            };
            match state {
                ChunkState::Size => {
                    let Some(line_end) = find_line(buf)? else {
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    let text = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| ProxyError::MalformedMessage("chunk size line".into()))?;
                    let size_text = text.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_text, 16).map_err(|_| {
                        ProxyError::MalformedMessage(format!("bad chunk size {size_text:?}"))
                    })?;
                    if size == 0 {
                        *state = ChunkState::Trailer;
                    } else {
                        *state = ChunkState::Data { remaining: size };
                    }
                }
                ChunkState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (*remaining).min(buf.len() as u64).min(MAX_CHUNK_BYTES as u64);
                    *remaining -= take;
                    if *remaining == 0 {
                        *state = ChunkState::DataCrlf;
                    }
                    return Ok(Some(Frame::Chunk {
                        data: buf.split_to(take as usize).freeze(),
                        last: false,
                    }));
                }
                ChunkState::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ProxyError::MalformedMessage(
                            "missing CRLF after chunk data".into(),
                        ));
                    }
                    buf.advance(2);
                    *state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // Trailer section: skip lines until the blank one.
                    let Some(line_end) = find_line(buf)? else {
                        return Ok(None);
                    };
                    let _ = buf.split_to(line_end + 2);
                    if line_end == 0 {
                        self.body = BodyState::Head;
                        return Ok(Some(Frame::Chunk {
                            data: Bytes::new(),
                            last: true,
                        }));
                    }
                }
            }
        }
    }
}

fn find_head_end(buf: &BytesMut) -> Result<Option<usize>, ProxyError> {
    if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
        let line_end = find_subslice(buf, b"\r\n").unwrap_or(pos);
        if line_end > MAX_INITIAL_LINE {
            return Err(ProxyError::MalformedMessage("initial line too long".into()));
        }
        if pos + 4 - line_end > MAX_HEADER_BYTES {
            return Err(ProxyError::MalformedMessage("header block too large".into()));
        }
        return Ok(Some(pos + 4));
    }
    if buf.len() > MAX_INITIAL_LINE + MAX_HEADER_BYTES {
        return Err(ProxyError::MalformedMessage("head too large".into()));
    }
    match find_subslice(buf, b"\r\n") {
        None if buf.len() > MAX_INITIAL_LINE => {
            Err(ProxyError::MalformedMessage("initial line too long".into()))
        }
        _ => Ok(None),
    }
}

fn find_line(buf: &BytesMut) -> Result<Option<usize>, ProxyError> {
    match find_subslice(buf, b"\r\n") {
        Some(pos) => Ok(Some(pos)),
        None if buf.len() > MAX_INITIAL_LINE => {
            Err(ProxyError::MalformedMessage("line too long".into()))
        }
        None => Ok(None),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn version_from(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::Http10,
        _ => Version::Http11,
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Headers {
    parsed
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

fn content_length(headers: &Headers) -> Option<u64> {
    headers.get("content-length").and_then(|v| v.trim().parse().ok())
}

/// Serializes frames back onto the wire. Chunked re-encoding mirrors the
/// framing of the most recently written head.
#[derive(Debug)]
pub struct Encoder {
    chunked: bool,
    tunneling: bool,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            chunked: false,
            tunneling: false,
        }
    }

    pub fn start_tunneling(&mut self) {
        self.tunneling = true;
    }

    pub fn encode(&mut self, frame: &Frame, out: &mut BytesMut) {
        match frame {
            Frame::Raw(data) => out.extend_from_slice(data),
            Frame::Request { head, .. } => {
                self.chunked = is_chunked(&head.headers);
                out.extend_from_slice(head.method.as_bytes());
                out.put_u8(b' ');
                out.extend_from_slice(head.uri.as_bytes());
                out.put_u8(b' ');
                out.extend_from_slice(head.version.as_str().as_bytes());
                out.extend_from_slice(b"\r\n");
                encode_headers(&head.headers, out);
            }
            Frame::Response { head, .. } => {
                self.chunked = is_chunked(&head.headers);
                out.extend_from_slice(head.version.as_str().as_bytes());
                out.put_u8(b' ');
                out.extend_from_slice(head.status.to_string().as_bytes());
                out.put_u8(b' ');
                out.extend_from_slice(head.reason.as_bytes());
                out.extend_from_slice(b"\r\n");
                encode_headers(&head.headers, out);
            }
            Frame::Chunk { data, last } => {
                if self.tunneling || !self.chunked {
                    out.extend_from_slice(data);
                } else {
                    if !data.is_empty() {
                        out.extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                        out.extend_from_slice(data);
                        out.extend_from_slice(b"\r\n");
                    }
                    if *last {
                        out.extend_from_slice(b"0\r\n\r\n");
                    }
                }
            }
        }
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

// ---------------------------------------------------------------------------
// Header and URI helpers shared by both legs.

/// Headers that only concern one transport hop and never cross the proxy
/// (RFC 2616 §13.5.1).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Authority (`host[:port]`) for a request: absolute-form URI first, then
/// `Host`, else empty.
pub fn parse_host_and_port(request: &HttpRequest) -> String {
    if request.is_connect() {
        return request.uri.clone();
    }
    if let Some(rest) = request
        .uri
        .strip_prefix("http://")
        .or_else(|| request.uri.strip_prefix("https://"))
    {
        let authority = rest.split(['/', '?']).next().unwrap_or("");
        if !authority.is_empty() {
            return authority.to_string();
        }
    }
    request.headers.get("host").unwrap_or("").trim().to_string()
}

/// Reduce an absolute-form URI to its origin-form (`/path?query`).
pub fn strip_host(uri: &str) -> String {
    let Some(rest) = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"))
    else {
        return uri.to_string();
    };
    match rest.find('/') {
        Some(idx) => rest[idx..].to_string(),
        None => "/".to_string(),
    }
}

/// Split an authority into host and port, defaulting the port.
pub fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

pub fn is_chunked(headers: &Headers) -> bool {
    headers.contains_token("transfer-encoding", "chunked")
}

/// Append `<version> <alias>` to `Via`, or set it.
pub fn add_via(headers: &mut Headers, version: Version, alias: &str) {
    let entry = format!("{} {}", version.via_token(), alias);
    match headers.get("via") {
        Some(existing) => {
            let combined = format!("{existing}, {entry}");
            headers.set("via", combined);
        }
        None => headers.push("Via", entry),
    }
}

/// Current time as an RFC 1123 HTTP-date.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Remove every header named by a `Connection` token (RFC 2616 §14.10),
/// then the `Connection` header list itself stays for the caller to scrub.
pub fn scrub_connection_tokens(headers: &mut Headers) {
    let tokens: Vec<String> = headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, v)| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("close") && !t.eq_ignore_ascii_case("keep-alive"))
        .collect();
    for token in tokens {
        headers.remove(&token);
    }
}

/// Drop all hop-by-hop headers.
pub fn scrub_hop_by_hop(headers: &mut Headers) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// `Proxy-Connection` is a de-facto synonym for `Connection`; rename it and
/// keep the value.
pub fn rename_proxy_connection(headers: &mut Headers) {
    if let Some(value) = headers.get("proxy-connection").map(str::to_string) {
        headers.remove("proxy-connection");
        if !headers.contains("connection") {
            headers.push("Connection", value);
        }
    }
}

/// Remove the `sdch` token from `Accept-Encoding`; drop the header when
/// nothing remains.
pub fn strip_sdch(headers: &mut Headers) {
    let Some(value) = headers.get("accept-encoding").map(str::to_string) else {
        return;
    };
    let kept: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.eq_ignore_ascii_case("sdch") && !t.is_empty())
        .collect();
    if kept.is_empty() {
        headers.remove("accept-encoding");
    } else {
        headers.set("accept-encoding", kept.join(", "));
    }
}

/// Keep-alive semantics for a message at `version` per RFC 2616 §8.1.
pub fn wants_keep_alive(version: Version, headers: &Headers) -> bool {
    if headers.contains_token("connection", "close") {
        return false;
    }
    match version {
        Version::Http11 => true,
        Version::Http10 => headers.contains_token("connection", "keep-alive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut Decoder, input: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn parses_simple_get() {
        let mut decoder = Decoder::new(HttpMode::Request);
        let frames = decode_all(
            &mut decoder,
            b"GET http://example.org/a HTTP/1.1\r\nHost: example.org\r\n\r\n",
        );
        assert_eq!(frames.len(), 1);
        let Frame::Request { head, last } = &frames[0] else {
            panic!("expected request head");
        };
        assert!(*last);
        assert_eq!(head.method, "GET");
        assert_eq!(head.uri, "http://example.org/a");
        assert_eq!(head.headers.get("host"), Some("example.org"));
    }

    #[test]
    fn parses_chunked_response() {
        let mut decoder = Decoder::new(HttpMode::Response);
        let frames = decode_all(
            &mut decoder,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], Frame::Response { last: false, .. }));
        let Frame::Chunk { data, last } = &frames[1] else {
            panic!()
        };
        assert_eq!(&data[..], b"Wiki");
        assert!(!*last);
        let Frame::Chunk { data, last } = &frames[3] else {
            panic!()
        };
        assert!(data.is_empty());
        assert!(*last);
    }

    #[test]
    fn fixed_body_ends_with_last_chunk() {
        let mut decoder = Decoder::new(HttpMode::Response);
        let frames = decode_all(
            &mut decoder,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK",
        );
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[1],
            Frame::Chunk { last: true, .. }
        ));
    }

    #[test]
    fn close_delimited_body_finishes_on_eof() {
        let mut decoder = Decoder::new(HttpMode::Response);
        let frames = decode_all(&mut decoder, b"HTTP/1.0 200 OK\r\n\r\nhello");
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Frame::Chunk { last: false, .. }));
        assert!(matches!(
            decoder.finish(),
            Some(Frame::Chunk { last: true, .. })
        ));
    }

    #[test]
    fn head_response_has_no_body() {
        let mut decoder = Decoder::new(HttpMode::Response);
        decoder.expect_headless_response();
        let frames = decode_all(
            &mut decoder,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
        );
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Response { last: true, .. }));
    }

    #[test]
    fn oversized_initial_line_is_rejected() {
        let mut decoder = Decoder::new(HttpMode::Request);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"GET /");
        buf.extend_from_slice(&vec![b'a'; MAX_INITIAL_LINE + 1]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn authority_prefers_absolute_uri() {
        let request = HttpRequest {
            method: "GET".into(),
            uri: "http://example.org:8080/a?b=c".into(),
            version: Version::Http11,
            headers: [("Host", "other.example")].into_iter().collect(),
        };
        assert_eq!(parse_host_and_port(&request), "example.org:8080");
    }

    #[test]
    fn authority_falls_back_to_host_header() {
        let request = HttpRequest {
            method: "GET".into(),
            uri: "/a".into(),
            version: Version::Http11,
            headers: [("Host", "example.org")].into_iter().collect(),
        };
        assert_eq!(parse_host_and_port(&request), "example.org");
    }

    #[test]
    fn strip_host_leaves_origin_form() {
        assert_eq!(strip_host("http://example.org/a?b=c"), "/a?b=c");
        assert_eq!(strip_host("http://example.org"), "/");
        assert_eq!(strip_host("/already"), "/already");
    }

    #[test]
    fn via_appends_to_existing() {
        let mut headers: Headers = [("Via", "1.1 upstream")].into_iter().collect();
        add_via(&mut headers, Version::Http11, "tollbooth");
        assert_eq!(headers.get("via"), Some("1.1 upstream, 1.1 tollbooth"));
    }

    #[test]
    fn scrubbing_is_idempotent() {
        let mut headers: Headers = [
            ("Connection", "keep-alive, x-custom"),
            ("X-Custom", "1"),
            ("Keep-Alive", "timeout=5"),
            ("TE", "trailers"),
            ("Accept", "*/*"),
        ]
        .into_iter()
        .collect();
        scrub_connection_tokens(&mut headers);
        scrub_hop_by_hop(&mut headers);
        let once = headers.clone();
        scrub_connection_tokens(&mut headers);
        scrub_hop_by_hop(&mut headers);
        assert_eq!(once, headers);
        assert!(!headers.contains("x-custom"));
        assert!(headers.contains("accept"));
    }

    #[test]
    fn proxy_connection_becomes_connection() {
        let mut headers: Headers = [("Proxy-Connection", "keep-alive")].into_iter().collect();
        rename_proxy_connection(&mut headers);
        assert_eq!(headers.get("connection"), Some("keep-alive"));
        assert!(!headers.contains("proxy-connection"));
    }

    #[test]
    fn sdch_token_is_removed() {
        let mut headers: Headers = [("Accept-Encoding", "gzip, sdch, br")].into_iter().collect();
        strip_sdch(&mut headers);
        assert_eq!(headers.get("accept-encoding"), Some("gzip, br"));
    }

    #[test]
    fn keep_alive_by_version() {
        let none = Headers::new();
        assert!(wants_keep_alive(Version::Http11, &none));
        assert!(!wants_keep_alive(Version::Http10, &none));
        let close: Headers = [("Connection", "close")].into_iter().collect();
        assert!(!wants_keep_alive(Version::Http11, &close));
        let ka: Headers = [("Connection", "keep-alive")].into_iter().collect();
        assert!(wants_keep_alive(Version::Http10, &ka));
    }

    #[test]
    fn encoder_round_trips_chunked_framing() {
        let mut encoder = Encoder::new();
        let head = HttpResponse {
            version: Version::Http11,
            status: 200,
            reason: "OK".into(),
            headers: [("Transfer-Encoding", "chunked")].into_iter().collect(),
        };
        let mut out = BytesMut::new();
        encoder.encode(
            &Frame::Response {
                head,
                last: false,
            },
            &mut out,
        );
        encoder.encode(
            &Frame::Chunk {
                data: Bytes::from_static(b"hello"),
                last: false,
            },
            &mut out,
        );
        encoder.encode(
            &Frame::Chunk {
                data: Bytes::new(),
                last: true,
            },
            &mut out,
        );
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.ends_with("5\r\nhello\r\n0\r\n\r\n"));
    }
}
