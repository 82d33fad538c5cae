//! Client request tokenizer.
//!
//! Implements the ten-step extraction the owning session runs on every
//! `CRLFCRLF` hit in its input buffer: carve the header block out,  parse
//! the request line and headers, decide keep-alive, normalize an
//! absolute-form URL against `Host`, and hand back a fully-formed
//! `ClientRequest` ready to enqueue on an upstream connection.

use crate::buffer::Buffer;
use crate::headers::HeaderMap;
use crate::http::method::Method;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn from_token(s: &str) -> Option<Version> {
        match s {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    MalformedRequestLine,
    UnsupportedVersion,
    UnsupportedMethod(String),
    MissingHost,
    Header(crate::headers::HeaderError),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::UnsupportedVersion => write!(f, "unsupported HTTP version"),
            ParseError::UnsupportedMethod(m) => write!(f, "unsupported method: {m}"),
            ParseError::MissingHost => write!(f, "request has no Host header"),
            ParseError::Header(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<crate::headers::HeaderError> for ParseError {
    fn from(e: crate::headers::HeaderError) -> Self {
        ParseError::Header(e)
    }
}

#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    /// Path-only form after absolute-URL normalization against `Host`.
    pub url: String,
    pub version: Version,
    /// The *original* client headers, retained so the response pipeline can
    /// consult `Accept-Encoding` etc.
    pub client_headers: HeaderMap,
    pub host: String,
    pub keep_alive: bool,
}

impl ClientRequest {
    /// Builds the header map to forward upstream: a copy of the client's
    /// headers with the hop-by-hop / proxy-only set stripped.
    pub fn upstream_headers(&self) -> HeaderMap {
        let mut h = self.client_headers.clone();
        h.remove_all(crate::headers::HOP_BY_HOP);
        h
    }
}

/// Attempts to tokenize one request out of the front of `buf`.
///
/// Returns `Ok(None)` if no complete `CRLFCRLF`-terminated header block is
/// buffered yet (caller should wait for more bytes). On a hit, the header
/// block (and its terminator) is always drained from `buf`, whether or not
/// parsing succeeds -- a malformed request is consumed, not retried.
pub fn try_parse(buf: &mut Buffer) -> Result<Option<ClientRequest>, ParseError> {
    let Some(term_pos) = buf.search(b"\r\n\r\n") else {
        return Ok(None);
    };

    let header_block = buf.data()[..term_pos].to_vec();
    buf.drain(term_pos + 4);

    // Skip leading CRLF/LF padding some clients insert between pipelined
    // requests.
    let mut start = 0;
    while header_block[start..].starts_with(b"\r\n") {
        start += 2;
    }
    let header_block = &header_block[start..];

    let line_end = find_crlf(header_block).ok_or(ParseError::MalformedRequestLine)?;
    let request_line =
        std::str::from_utf8(&header_block[..line_end]).map_err(|_| ParseError::MalformedRequestLine)?;

    let mut parts = request_line.split(' ');
    let method_tok = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let url = parts.next().ok_or(ParseError::MalformedRequestLine)?.to_string();
    let version_tok = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::MalformedRequestLine);
    }

    let version = Version::from_token(version_tok).ok_or(ParseError::UnsupportedVersion)?;

    let method = Method::from_token(method_tok)
        .ok_or_else(|| ParseError::UnsupportedMethod(method_tok.to_string()))?;

    // Re-attach a blank-line terminator so HeaderMap::parse has its usual
    // stop condition; the original terminator was stripped along with the
    // CRLFCRLF hit above.
    let mut header_bytes = header_block[line_end + 2..].to_vec();
    header_bytes.extend_from_slice(b"\r\n");
    let (client_headers, _) = HeaderMap::parse(&header_bytes)?;

    let host = client_headers.find("Host").ok_or(ParseError::MissingHost)?.to_string();

    let keep_alive = match version {
        Version::Http10 => {
            client_headers
                .find("Connection")
                .map(|v| v.eq_ignore_ascii_case("Keep-Alive"))
                .unwrap_or(false)
                && client_headers.find("Keep-Alive").is_some()
        }
        Version::Http11 => !client_headers
            .find("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false),
    };

    let url = normalize_absolute_url(&url, &host);

    if !method.is_serviced() {
        return Err(ParseError::UnsupportedMethod(method_tok.to_string()));
    }

    Ok(Some(ClientRequest {
        method,
        url,
        version,
        client_headers,
        host,
        keep_alive,
    }))
}

/// Strips an absolute-form `http://HOST` prefix that matches the `Host`
/// header, leaving a path. Leaves the URL untouched otherwise (already a
/// path, or an absolute URL to a different host than `Host` claims).
fn normalize_absolute_url(url: &str, host: &str) -> String {
    let prefix = format!("http://{host}");
    if let Some(rest) = url.strip_prefix(&prefix) {
        if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        }
    } else {
        url.to_string()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(raw: &[u8]) -> Result<Option<ClientRequest>, ParseError> {
        let mut buf = Buffer::new();
        buf.append(raw);
        try_parse(&mut buf)
    }

    #[test]
    fn incomplete_request_returns_none() {
        let result = parse_one(b"GET / HTTP/1.1\r\nHost: x").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn simple_get_parses() {
        let req = parse_one(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.version, Version::Http11);
        assert!(req.keep_alive);
    }

    #[test]
    fn absolute_form_url_is_normalized_against_host() {
        let req = parse_one(
            b"GET http://example.test/a/b HTTP/1.1\r\nHost: example.test\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(req.url, "/a/b");
    }

    #[test]
    fn http10_requires_explicit_keep_alive_pair() {
        let req = parse_one(b"GET / HTTP/1.0\r\nHost: x\r\n\r\n").unwrap().unwrap();
        assert!(!req.keep_alive);

        let req2 = parse_one(
            b"GET / HTTP/1.0\r\nHost: x\r\nConnection: Keep-Alive\r\nKeep-Alive: 300\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(req2.keep_alive);
    }

    #[test]
    fn http11_connection_close_disables_keep_alive() {
        let req = parse_one(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = parse_one(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::MissingHost);
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let err = parse_one(b"PUT /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnsupportedMethod("PUT".to_string()));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = parse_one(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n").unwrap_err();
        assert_eq!(err, ParseError::UnsupportedVersion);
    }

    #[test]
    fn upstream_headers_strip_hop_by_hop_set() {
        let req = parse_one(
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\nAccept-Encoding: gzip\r\nProxy-Connection: Keep-Alive\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        let up = req.upstream_headers();
        assert!(up.find("Connection").is_none());
        assert!(up.find("Accept-Encoding").is_none());
        assert!(up.find("Proxy-Connection").is_none());
        assert_eq!(req.client_headers.find("Accept-Encoding"), Some("gzip"));
    }
}
