//! Per-origin upstream HTTP client.
//!
//! One `UpstreamConnection` is created the first time a session needs to
//! talk to a given `host:port` and is reused for subsequent requests to the
//! same origin as long as it isn't marked `close_on_idle`. Mirrors
//! `HttpConnection`'s buffered-socket shape on the client side of this
//! crate, but drives requests out instead of responses, one at a time,
//! matching replies to the FIFO head positionally.

use crate::buffer::Buffer;
use crate::error::ProxyError;
use crate::headers::HeaderMap;
use crate::http::response::{ParsedResponse, ReadError as ResponseReadError, ResponseReader};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Why an in-flight request's reply will never arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Timeout,
    Eof,
    InvalidHeader,
}

impl From<ResponseReadError> for Failure {
    fn from(_: ResponseReadError) -> Self {
        Failure::InvalidHeader
    }
}

impl From<Failure> for ProxyError {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Timeout => ProxyError::Timeout,
            Failure::Eof => ProxyError::Eof,
            Failure::InvalidHeader => ProxyError::Parse("invalid upstream framing".into()),
        }
    }
}

/// A request handed to the upstream, waiting its turn on the wire.
pub struct PendingRequest {
    pub request_id: u64,
    /// Request-line + sanitized headers, already serialized.
    pub wire_bytes: Vec<u8>,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_MAX_DEFAULT: u32 = 20;
const RETRY_CAP_SECS: u64 = 3600;

pub struct UpstreamConnection {
    pub host: String,
    pub port: u16,
    pub token: Token,
    pub state: State,
    stream: Option<TcpStream>,
    fifo: std::collections::VecDeque<PendingRequest>,
    write_buf: Buffer,
    read_buf: Buffer,
    reader: ResponseReader,
    dispatched_current: bool,
    pub retry_count: u32,
    pub retry_max: u32,
    pub close_on_idle: bool,
    pub request_count: u64,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

impl UpstreamConnection {
    pub fn new(host: String, port: u16, token: Token) -> Self {
        UpstreamConnection {
            host,
            port,
            token,
            state: State::Disconnected,
            stream: None,
            fifo: std::collections::VecDeque::new(),
            write_buf: Buffer::new(),
            read_buf: Buffer::new(),
            reader: ResponseReader::new(),
            dispatched_current: false,
            retry_count: 0,
            retry_max: RETRY_MAX_DEFAULT,
            close_on_idle: false,
            request_count: 0,
            deadline: None,
            retry_at: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.fifo.is_empty() && self.state == State::Connected
    }

    /// Appends a request to the FIFO. The caller is responsible for kicking
    /// off `connect()` when this returns `Disconnected` with an empty FIFO
    /// (i.e. a brand-new connection).
    pub fn enqueue(&mut self, request_id: u64, wire_bytes: Vec<u8>) {
        self.fifo.push_back(PendingRequest { request_id, wire_bytes });
        self.request_count += 1;
    }

    pub fn has_pending(&self) -> bool {
        !self.fifo.is_empty()
    }

    /// Begins a non-blocking connect. Registers for writable readiness; the
    /// caller's event loop must call `on_writable` once the socket reports
    /// ready.
    pub fn connect(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "bad origin address"))?;
        let mut stream = TcpStream::connect(addr)?;
        registry.register(&mut stream, self.token, Interest::WRITABLE)?;
        self.stream = Some(stream);
        self.state = State::Connecting;
        self.deadline = Some(Instant::now() + CONNECT_TIMEOUT);
        Ok(())
    }

    /// Called when the connecting socket becomes writable. Checks
    /// `SO_ERROR`; on success transitions to `Connected` and dispatches the
    /// FIFO head.
    pub fn on_writable(&mut self, registry: &mio::Registry) -> Result<(), Failure> {
        match self.state {
            State::Connecting => {
                let stream = self.stream.as_ref().expect("connecting without a stream");
                match stream.take_error() {
                    Ok(None) => {
                        self.state = State::Connected;
                        self.retry_count = 0;
                        self.deadline = None;
                        self.dispatch(registry).map_err(|_| Failure::Eof)?;
                        Ok(())
                    }
                    Ok(Some(_)) | Err(_) => Err(Failure::Eof),
                }
            }
            State::Connected => {
                self.flush_write_buf(registry).map_err(|_| Failure::Eof)
            }
            State::Disconnected => Ok(()),
        }
    }

    /// Serializes the FIFO head's request onto the write buffer and
    /// registers for readable+writable interest.
    fn dispatch(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        if self.dispatched_current {
            return Ok(());
        }
        let Some(next) = self.fifo.front() else { return Ok(()) };
        self.write_buf.append(&next.wire_bytes);
        self.dispatched_current = true;
        self.reader.reset();
        self.deadline = Some(Instant::now() + WRITE_TIMEOUT);
        if let Some(stream) = self.stream.as_mut() {
            registry.reregister(stream, self.token, Interest::READABLE | Interest::WRITABLE)?;
        }
        self.flush_write_buf(registry)
    }

    fn flush_write_buf(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        let Some(stream) = self.stream.as_mut() else { return Ok(()) };
        while !self.write_buf.is_empty() {
            match self.write_buf.write_to(stream) {
                Ok(0) => break,
                Ok(n) => self.write_buf.drain(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        if self.write_buf.is_empty() {
            self.deadline = Some(Instant::now() + READ_TIMEOUT);
            registry.reregister(stream, self.token, Interest::READABLE)?;
        }
        Ok(())
    }

    /// Reads available bytes and feeds the response reader. Returns
    /// `Ok(Some(response))` once the head request's reply is fully parsed,
    /// `Ok(None)` if more data is needed, `Err(failure)` on a terminal
    /// condition for the in-flight request.
    pub fn on_readable(&mut self) -> Result<Option<(u64, ParsedResponse)>, Failure> {
        let Some(stream) = self.stream.as_mut() else { return Ok(None) };
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if self.is_idle_watch() {
                        self.state = State::Disconnected;
                        return Ok(None);
                    }
                    if self.dispatched_current && self.reader.finish_on_eof() {
                        self.state = State::Disconnected;
                        return Ok(Some(self.take_response()));
                    }
                    return Err(Failure::Eof);
                }
                Ok(n) => self.read_buf.append(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return Err(Failure::Eof),
            }
        }

        if self.is_idle_watch() {
            // Any byte (or EOF, handled above) on an idle kept-alive
            // connection means the origin is going away; stop trusting it.
            self.state = State::Disconnected;
            return Ok(None);
        }

        if !self.dispatched_current {
            return Ok(None);
        }

        match self.reader.feed(&mut self.read_buf) {
            Ok(true) => {
                self.deadline = None;
                Ok(Some(self.take_response()))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_idle_watch(&self) -> bool {
        self.fifo.is_empty() && !self.dispatched_current
    }

    fn take_response(&mut self) -> (u64, ParsedResponse) {
        let reader = std::mem::replace(&mut self.reader, ResponseReader::new());
        let parsed = reader.take();
        let request_id = self.fifo.pop_front().map(|r| r.request_id).unwrap_or(0);
        self.dispatched_current = false;
        (request_id, parsed)
    }

    /// The id of the request currently occupying the FIFO head, if any.
    /// Used by the caller to attribute a connect/read/write failure.
    pub fn current_request_id(&self) -> Option<u64> {
        self.fifo.front().map(|r| r.request_id)
    }

    /// Called after `enqueue` when the connection was already `Connected`
    /// and idle, to start dispatching the newly queued request immediately
    /// instead of waiting for a readiness event that may never come (the
    /// socket could already be idle-read-armed with nothing else pending).
    pub fn kick(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        if self.state == State::Connected && !self.dispatched_current {
            self.dispatch(registry)
        } else {
            Ok(())
        }
    }

    /// Advances to the next queued request after the caller has consumed
    /// the current response, or idles the connection if the FIFO is empty.
    pub fn advance(&mut self, registry: &mio::Registry, origin_close: bool) -> std::io::Result<()> {
        if origin_close {
            self.close_on_idle = true;
        }
        if self.close_on_idle && self.fifo.is_empty() {
            self.disconnect(registry);
            return Ok(());
        }
        if !self.fifo.is_empty() {
            self.dispatch(registry)
        } else if let Some(stream) = self.stream.as_mut() {
            // Arm the idle-close read-watch: we expect silence until the
            // next request, but any byte or EOF means the origin hung up.
            registry.reregister(stream, self.token, Interest::READABLE)
        } else {
            Ok(())
        }
    }

    pub fn disconnect(&mut self, registry: &mio::Registry) {
        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.state = State::Disconnected;
        self.dispatched_current = false;
    }

    /// Exponential backoff for the next retry after a connect failure.
    /// `min(3600s, 2^n)`.
    pub fn schedule_retry(&mut self) -> Option<Duration> {
        if self.retry_count >= self.retry_max {
            return None;
        }
        let secs = 2u64.saturating_pow(self.retry_count).min(RETRY_CAP_SECS);
        self.retry_count += 1;
        let at = Instant::now() + Duration::from_secs(secs);
        self.retry_at = Some(at);
        Some(Duration::from_secs(secs))
    }

    pub fn retry_due(&self) -> bool {
        self.retry_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }

    /// Drains the FIFO, returning the failed request ids in order, for the
    /// caller to synthesize failure handling per request.
    pub fn drain_fifo(&mut self) -> Vec<u64> {
        self.dispatched_current = false;
        self.fifo.drain(..).map(|r| r.request_id).collect()
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}

/// Serializes a proxied request: request-line, sanitized headers, blank
/// line, no body (GET is the only serviced method).
pub fn serialize_request(method: &str, url: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(headers.len() * 32 + url.len() + 32);
    out.extend_from_slice(format!("{method} {url} HTTP/1.1\r\n").as_bytes());
    headers.serialize_into(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderMap;

    #[test]
    fn serialize_request_writes_request_line_and_headers() {
        let mut headers = HeaderMap::new();
        headers.add("Host", "example.test").unwrap();
        let bytes = serialize_request("GET", "/a/b", &headers);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /a/b HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.test\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut up = UpstreamConnection::new("x.test".into(), 80, Token(1));
        let d0 = up.schedule_retry().unwrap();
        let d1 = up.schedule_retry().unwrap();
        assert_eq!(d0, Duration::from_secs(1));
        assert_eq!(d1, Duration::from_secs(2));
        up.retry_count = up.retry_max;
        assert!(up.schedule_retry().is_none());
    }

    #[test]
    fn enqueue_then_drain_preserves_order() {
        let mut up = UpstreamConnection::new("x.test".into(), 80, Token(1));
        up.enqueue(1, b"a".to_vec());
        up.enqueue(2, b"b".to_vec());
        assert_eq!(up.drain_fifo(), vec![1, 2]);
    }
}
