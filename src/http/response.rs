//! Upstream response reader: `FirstLine -> Headers -> Body` state machine
//! over an `UpstreamConnection`'s input buffer, plus the small helper used
//! to assemble the final client-bound response bytes.

use crate::buffer::Buffer;
use crate::headers::HeaderMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    MalformedStatusLine,
    Header(crate::headers::HeaderError),
    InvalidChunkSize,
    /// No `Content-Length`, no chunked framing, and the origin didn't say
    /// `Connection: close` either -- there is no way to know when the body
    /// ends without reading until EOF, which would also wreck keep-alive
    /// reuse of this connection.
    NoLengthKeepAlive,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::MalformedStatusLine => write!(f, "malformed status line"),
            ReadError::Header(e) => write!(f, "{e}"),
            ReadError::InvalidChunkSize => write!(f, "invalid chunk size"),
            ReadError::NoLengthKeepAlive => {
                write!(f, "no content length, but the server wants to keep the connection open")
            }
        }
    }
}

impl std::error::Error for ReadError {}

impl From<crate::headers::HeaderError> for ReadError {
    fn from(e: crate::headers::HeaderError) -> Self {
        ReadError::Header(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    TrailingCrlf,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Chunked(ChunkState),
    Length(usize),
    UntilClose,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Body(BodyFraming),
    Done,
}

#[derive(Debug)]
pub struct ParsedResponse {
    pub major: u8,
    pub minor: u8,
    pub status_code: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Incremental reader for one response on an upstream connection's wire.
/// Reused across responses by calling `reset` once a `ParsedResponse` has
/// been taken.
pub struct ResponseReader {
    state: State,
    major: u8,
    minor: u8,
    status_code: u16,
    reason: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseReader {
    pub fn new() -> Self {
        ResponseReader {
            state: State::StatusLine,
            major: 1,
            minor: 1,
            status_code: 0,
            reason: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = ResponseReader::new();
    }

    /// Drives the state machine as far as `buf` allows. Returns `Ok(true)`
    /// once a full response (status line + headers + framed body) has been
    /// assembled; the caller then takes it with `take`. Returns `Ok(false)`
    /// when more bytes are needed (including the read-until-close case,
    /// which only completes via `finish_on_eof`).
    pub fn feed(&mut self, buf: &mut Buffer) -> Result<bool, ReadError> {
        loop {
            match &mut self.state {
                State::StatusLine => {
                    let Some(line) = buf.readline() else { return Ok(false) };
                    let line = std::str::from_utf8(&line).map_err(|_| ReadError::MalformedStatusLine)?;
                    let mut parts = line.splitn(3, ' ');
                    let version = parts.next().ok_or(ReadError::MalformedStatusLine)?;
                    let code = parts.next().ok_or(ReadError::MalformedStatusLine)?;
                    let reason = parts.next().unwrap_or("").to_string();

                    let (major, minor) = parse_http_version(version)?;
                    let status_code: u16 = code.parse().map_err(|_| ReadError::MalformedStatusLine)?;

                    self.major = major;
                    self.minor = minor;
                    self.status_code = status_code;
                    self.reason = reason;
                    self.state = State::Headers;
                }
                State::Headers => {
                    // Reuse HeaderMap::parse on whatever is buffered;
                    // it needs the blank-line terminator to know where to
                    // stop, so probe for CRLFCRLF first like the request
                    // tokenizer does.
                    let Some(term) = buf.search(b"\r\n\r\n") else { return Ok(false) };
                    let block = buf.data()[..term + 2].to_vec();
                    buf.drain(term + 4);
                    let (headers, _) = HeaderMap::parse(&block)?;
                    self.headers = headers;
                    self.state = State::Body(self.classify_framing()?);
                }
                State::Body(BodyFraming::Length(remaining)) => {
                    let avail = buf.len().min(*remaining);
                    self.body.extend_from_slice(&buf.data()[..avail]);
                    buf.drain(avail);
                    *remaining -= avail;
                    if *remaining == 0 {
                        self.state = State::Done;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                State::Body(BodyFraming::UntilClose) => {
                    let avail = buf.len();
                    if avail > 0 {
                        self.body.extend_from_slice(buf.data());
                        buf.drain(avail);
                    }
                    return Ok(false);
                }
                State::Body(BodyFraming::Chunked(chunk_state)) => {
                    let before = buf.len();
                    let before_state = *chunk_state;
                    match self.drive_chunked(buf, before_state)? {
                        Some(next) => {
                            let made_progress = next != before_state || buf.len() != before;
                            self.state = State::Body(BodyFraming::Chunked(next));
                            if !made_progress {
                                return Ok(false);
                            }
                        }
                        None => {
                            self.state = State::Done;
                            return Ok(true);
                        }
                    }
                }
                State::Done => return Ok(true),
            }
        }
    }

    /// Only meaningful while framed `UntilClose`: the origin closing the
    /// connection is itself the terminator.
    pub fn finish_on_eof(&mut self) -> bool {
        if matches!(self.state, State::Body(BodyFraming::UntilClose)) {
            self.state = State::Done;
            true
        } else {
            false
        }
    }

    /// Picks the body-framing strategy per §4.4. Mirrors
    /// `evhttp_get_body_length`: no `Content-Length` and no `Connection`
    /// header at all means read-until-close is the only option and is
    /// accepted; no `Content-Length` with a `Connection` header that isn't
    /// `close` is the one combination that's rejected outright, since
    /// there'd be no way to tell the body apart from a reused connection's
    /// next response.
    fn classify_framing(&self) -> Result<BodyFraming, ReadError> {
        if self
            .headers
            .find("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            return Ok(BodyFraming::Chunked(ChunkState::Size));
        }

        if let Some(len) = self.headers.find("Content-Length").and_then(|v| v.parse().ok()) {
            return Ok(BodyFraming::Length(len));
        }

        match self.headers.find("Connection") {
            None => Ok(BodyFraming::UntilClose),
            Some(v) if v.eq_ignore_ascii_case("close") => Ok(BodyFraming::UntilClose),
            Some(_) => Err(ReadError::NoLengthKeepAlive),
        }
    }

    /// Advances one chunked-body step. Returns `Ok(Some(next_state))` if
    /// more chunk data remains to read, `Ok(None)` once the terminating
    /// zero-chunk and trailers have been consumed.
    fn drive_chunked(
        &mut self,
        buf: &mut Buffer,
        state: ChunkState,
    ) -> Result<Option<ChunkState>, ReadError> {
        match state {
            ChunkState::Size => {
                let Some(line) = buf.readline() else { return Ok(Some(state)) };
                let line = std::str::from_utf8(&line).map_err(|_| ReadError::InvalidChunkSize)?;
                let size_str = line.split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(size_str, 16).map_err(|_| ReadError::InvalidChunkSize)?;
                if size == 0 {
                    Ok(Some(ChunkState::Trailers))
                } else {
                    Ok(Some(ChunkState::Data(size)))
                }
            }
            ChunkState::Data(remaining) => {
                let avail = buf.len().min(remaining);
                if avail == 0 {
                    return Ok(Some(state));
                }
                self.body.extend_from_slice(&buf.data()[..avail]);
                buf.drain(avail);
                let left = remaining - avail;
                if left == 0 {
                    Ok(Some(ChunkState::TrailingCrlf))
                } else {
                    Ok(Some(ChunkState::Data(left)))
                }
            }
            ChunkState::TrailingCrlf => {
                if buf.len() < 2 {
                    return Ok(Some(state));
                }
                if &buf.data()[..2] != b"\r\n" {
                    return Err(ReadError::InvalidChunkSize);
                }
                buf.drain(2);
                Ok(Some(ChunkState::Size))
            }
            ChunkState::Trailers => {
                // Trailers are header-shaped lines terminated by a blank
                // line; we don't surface them (no caller needs trailer
                // values) but still have to consume them off the wire.
                let Some(line) = buf.readline() else { return Ok(Some(state)) };
                if line.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(ChunkState::Trailers))
                }
            }
        }
    }

    pub fn take(self) -> ParsedResponse {
        ParsedResponse {
            major: self.major,
            minor: self.minor,
            status_code: self.status_code,
            reason: self.reason,
            headers: self.headers,
            body: self.body,
        }
    }

    pub fn is_until_close(&self) -> bool {
        matches!(self.state, State::Body(BodyFraming::UntilClose))
    }
}

impl Default for ResponseReader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_http_version(tok: &str) -> Result<(u8, u8), ReadError> {
    let rest = tok.strip_prefix("HTTP/").ok_or(ReadError::MalformedStatusLine)?;
    let mut it = rest.splitn(2, '.');
    let major: u8 = it.next().and_then(|s| s.parse().ok()).ok_or(ReadError::MalformedStatusLine)?;
    let minor: u8 = it.next().and_then(|s| s.parse().ok()).ok_or(ReadError::MalformedStatusLine)?;
    Ok((major, minor))
}

/// Assembles a full response on the wire: status line, headers in the
/// order given, blank line, body.
pub fn assemble(status_line: &str, headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(status_line.len() + body.len() + 128);
    out.extend_from_slice(status_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    headers.serialize_into(&mut out);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

pub fn status_line(major: u8, minor: u8, code: u16, reason: &str) -> String {
    format!("HTTP/{major}.{minor} {code} {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(raw: &[u8]) -> ParsedResponse {
        let mut reader = ResponseReader::new();
        let mut buf = Buffer::new();
        buf.append(raw);
        let done = reader.feed(&mut buf).unwrap();
        assert!(done, "expected response to complete in one feed");
        reader.take()
    }

    #[test]
    fn content_length_framed_body() {
        let resp = feed_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, b"hello");
        assert_eq!(resp.headers.find("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn chunked_body_decodes_to_concatenated_chunks() {
        let resp = feed_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Type: text/html\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        );
        assert_eq!(resp.body, b"hello world");
        assert!(resp.headers.find("Transfer-Encoding").is_some());
    }

    #[test]
    fn until_close_framing_waits_for_eof() {
        let mut reader = ResponseReader::new();
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nsome body");
        assert_eq!(reader.feed(&mut buf).unwrap(), false);
        assert!(reader.is_until_close());
        assert!(reader.finish_on_eof());
        let resp = reader.take();
        assert_eq!(resp.body, b"some body");
    }

    #[test]
    fn until_close_framing_allowed_when_connection_close_is_explicit() {
        let mut reader = ResponseReader::new();
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nbody");
        assert_eq!(reader.feed(&mut buf).unwrap(), false);
        assert!(reader.is_until_close());
    }

    #[test]
    fn no_length_with_keep_alive_connection_is_invalid_header() {
        let mut reader = ResponseReader::new();
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n");
        let err = reader.feed(&mut buf).unwrap_err();
        assert_eq!(err, ReadError::NoLengthKeepAlive);
    }

    #[test]
    fn incremental_feed_across_partial_chunks() {
        let mut reader = ResponseReader::new();
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel");
        assert_eq!(reader.feed(&mut buf).unwrap(), false);
        buf.append(b"lo\r\n0\r\n\r\n");
        assert_eq!(reader.feed(&mut buf).unwrap(), true);
        assert_eq!(reader.take().body, b"hello");
    }

    #[test]
    fn assemble_writes_status_headers_blank_body() {
        let mut h = HeaderMap::new();
        h.add("Content-Type", "text/plain").unwrap();
        h.add("Content-Length", "2").unwrap();
        let bytes = assemble(&status_line(1, 1, 200, "OK"), &h, b"hi");
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.ends_with("\r\n\r\nhi"));
    }
}
