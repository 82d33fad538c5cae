//! Event Core + Listener & Wiring.
//!
//! A single `mio::Poll` drives everything: the listener, every client
//! socket, and every upstream socket, each under its own `Token`. Routing an
//! event back to the right `ClientSession` (and, for upstream tokens, the
//! right `UpstreamConnection` within it) is a `HashMap` lookup, the same
//! shape as the teacher's `cgi_to_client: HashMap<Token, Token>` auxiliary
//! map in `HttpConnection`.

use crate::config::Options;
use crate::http::request::ClientRequest;
use crate::http::response::ParsedResponse;
use crate::pipeline;
use crate::session::{self, ClientSession};
use crate::upstream::{self, UpstreamConnection};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use proxy_log::{debug, errors, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

pub struct Server {
    listener: TcpListener,
    sessions: HashMap<Token, ClientSession>,
    /// Upstream socket token -> (owning client token, index into that
    /// session's `upstreams` vec).
    endpoints: HashMap<Token, (Token, usize)>,
    next_token: usize,
    retry_max: u32,
}

impl Server {
    pub fn new(opts: &Options, poll: &Poll) -> io::Result<Self> {
        let mut listener = bind_listener(opts.port)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        info!("listening on 0.0.0.0:{}", opts.port);
        Ok(Server {
            listener,
            sessions: HashMap::new(),
            endpoints: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            retry_max: opts.retry_max,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    pub fn run(mut self, mut poll: Poll) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = self.next_retry_timeout();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                let token = event.token();
                if token == LISTENER_TOKEN {
                    self.accept_loop(poll.registry());
                    continue;
                }
                if let Some((client_token, idx)) = self.endpoints.get(&token).copied() {
                    self.handle_upstream_event(poll.registry(), client_token, idx, event.is_readable(), event.is_writable());
                    continue;
                }
                self.handle_client_event(poll.registry(), token, event.is_readable(), event.is_writable());
            }

            self.run_retries(poll.registry());
            crate::timeouts::sweep(&mut self, poll.registry());
            self.dispose_dead(poll.registry());
        }
    }

    fn accept_loop(&mut self, registry: &mio::Registry) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = apply_accepted_socket_options(&stream) {
                        warn!("failed to set accepted-socket options for {}: {}", addr, e);
                    }
                    let token = self.alloc_token();
                    if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                        errors!("failed to register accepted socket: {}", e);
                        continue;
                    }
                    debug!("accepted {} as {:?}", addr, token);
                    self.sessions.insert(token, ClientSession::new(stream, addr, token));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    errors!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_client_event(&mut self, registry: &mio::Registry, token: Token, readable: bool, writable: bool) {
        let Some(session) = self.sessions.get_mut(&token) else { return };
        session.touch();

        if readable {
            if session.read_available() {
                session.read_closed = true;
            }
            let dispatched = session.drain_requests();
            for (request_id, host, port, req) in dispatched {
                self.dispatch_to_upstream(registry, token, request_id, host, port, &req);
            }
        }

        if readable || writable {
            if let Some(session) = self.sessions.get_mut(&token) {
                session.kick(registry);
            }
        }
    }

    fn dispatch_to_upstream(
        &mut self,
        registry: &mio::Registry,
        client_token: Token,
        request_id: u64,
        host: String,
        port: u16,
        req: &ClientRequest,
    ) {
        let wire = session::build_upstream_request(req);
        let retry_max = self.retry_max;
        let Some(session) = self.sessions.get_mut(&client_token) else { return };

        let existing = session
            .upstreams
            .iter()
            .position(|u| u.host == host && u.port == port && !u.close_on_idle);

        let idx = match existing {
            Some(i) => i,
            None => {
                let upstream_token = self.alloc_token();
                let mut conn = UpstreamConnection::new(host.clone(), port, upstream_token);
                conn.retry_max = retry_max;
                session.upstreams.push(conn);
                let i = session.upstreams.len() - 1;
                self.endpoints.insert(upstream_token, (client_token, i));
                i
            }
        };

        let up = &mut session.upstreams[idx];
        let upstream_token = up.token;
        let needs_kick = up.state == upstream::State::Connected && !up.has_pending();
        up.enqueue(request_id, wire);
        session.note_dispatch(request_id, upstream_token);

        let up = &mut session.upstreams[idx];
        let result = if up.state == upstream::State::Disconnected {
            up.connect(registry)
        } else if needs_kick {
            up.kick(registry)
        } else {
            Ok(())
        };

        if let Err(e) = result {
            warn!("connect to {}:{} failed: {}", host, port, e);
            self.fail_pending(registry, client_token, idx, false);
        }
    }

    fn handle_upstream_event(
        &mut self,
        registry: &mio::Registry,
        client_token: Token,
        idx: usize,
        readable: bool,
        writable: bool,
    ) {
        let was_connecting = {
            let Some(session) = self.sessions.get(&client_token) else { return };
            session.upstreams.get(idx).map(|u| u.state == upstream::State::Connecting).unwrap_or(true)
        };

        if writable {
            let Some(session) = self.sessions.get_mut(&client_token) else { return };
            let Some(up) = session.upstreams.get_mut(idx) else { return };
            if let Err(failure) = up.on_writable(registry) {
                self.fail_pending(registry, client_token, idx, was_connecting);
                let _ = failure;
                return;
            }
        }

        if readable {
            let Some(session) = self.sessions.get_mut(&client_token) else { return };
            let Some(up) = session.upstreams.get_mut(idx) else { return };
            match up.on_readable() {
                Ok(Some((request_id, parsed))) => {
                    self.complete_response(registry, client_token, idx, request_id, parsed);
                }
                Ok(None) => {}
                Err(_failure) => {
                    self.fail_pending(registry, client_token, idx, was_connecting);
                }
            }
        }
    }

    fn complete_response(
        &mut self,
        registry: &mio::Registry,
        client_token: Token,
        idx: usize,
        request_id: u64,
        parsed: ParsedResponse,
    ) {
        let Some(session) = self.sessions.get_mut(&client_token) else { return };
        let accept_encoding = session.accept_encoding_for(request_id);
        let client_read_closed = session.client_read_closed_for(request_id);
        let transformed = pipeline::process(parsed, accept_encoding.as_deref(), client_read_closed);

        session.complete(request_id, transformed.wire_bytes, client_read_closed || transformed.origin_close);

        let Some(up) = session.upstreams.get_mut(idx) else { return };
        if let Err(e) = up.advance(registry, transformed.origin_close) {
            debug!("upstream advance failed: {}", e);
        }
        session.kick(registry);
    }

    /// Fails every request currently sitting on the named upstream's FIFO,
    /// synthesizing a 502 for each so the client's response ordering slot
    /// is always eventually filled. Per §7, both a connect failure and a
    /// `Timeout` retry identically (backoff up to `retry_max`, then drain);
    /// `retry_eligible` is false only for failure classes that should fail
    /// the head request immediately instead (e.g. `EOF` encountered after a
    /// connection that was already fully established and dispatching).
    fn fail_pending(&mut self, registry: &mio::Registry, client_token: Token, idx: usize, retry_eligible: bool) {
        let Some(session) = self.sessions.get_mut(&client_token) else { return };
        let Some(up) = session.upstreams.get_mut(idx) else { return };

        up.disconnect(registry);

        if retry_eligible {
            if let Some(delay) = up.schedule_retry() {
                debug!("retrying {}:{} in {:?}", up.host, up.port, delay);
                return;
            }
        }

        for request_id in up.drain_fifo() {
            let bytes = pipeline::synthesize(502, "Bad Gateway", true);
            session.complete(request_id, bytes, true);
        }
        session.kick(registry);
    }

    /// Re-attempts connect() for any upstream whose backoff has elapsed.
    fn run_retries(&mut self, registry: &mio::Registry) {
        for session in self.sessions.values_mut() {
            for up in session.upstreams.iter_mut() {
                if up.state == upstream::State::Disconnected && up.has_pending() && up.retry_due() {
                    let _ = up.connect(registry);
                }
            }
        }
    }

    fn next_retry_timeout(&self) -> Option<Duration> {
        // Retries are cheap to re-check on every wakeup; a short fixed poll
        // timeout bounds how late a scheduled retry can fire instead of
        // tracking exact per-upstream deadlines here.
        Some(Duration::from_millis(500))
    }

    /// `(token, peer_addr)` for every session that has made no progress
    /// within the client idle deadline. Read-only: the timeout sweep
    /// decides what to do with each one.
    pub(crate) fn idle_sessions(&self, now: std::time::Instant, idle_timeout: Duration) -> Vec<(Token, SocketAddr)> {
        self.sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > idle_timeout)
            .map(|(t, s)| (*t, s.peer_addr))
            .collect()
    }

    /// `(client_token, upstream_index, host, port)` for every upstream
    /// connection whose per-operation deadline (connect/write/read) has
    /// elapsed. An idle, kept-alive connection has no deadline armed (see
    /// `UpstreamConnection::advance`), so this never fires for the
    /// idle-close read-watch, only for a stalled connect/write/read.
    pub(crate) fn timed_out_upstreams(&self, now: std::time::Instant) -> Vec<(Token, usize, String, u16)> {
        let mut out = Vec::new();
        for (token, session) in self.sessions.iter() {
            for (idx, up) in session.upstreams.iter().enumerate() {
                if up.timed_out(now) {
                    out.push((*token, idx, up.host.clone(), up.port));
                }
            }
        }
        out
    }

    pub(crate) fn session_tokens(&self) -> Vec<Token> {
        self.sessions.keys().copied().collect()
    }

    pub(crate) fn mark_dead(&mut self, token: Token) {
        if let Some(session) = self.sessions.get_mut(&token) {
            session.dead = true;
        }
    }

    /// Routes a deadline-sweep-detected upstream timeout through the same
    /// schedule-retry-then-drain-on-exhaustion path a connect failure
    /// takes, per §7's "Timeout ... outgoing retries as above [identically
    /// to ConnectError]".
    pub(crate) fn fail_upstream_timeout(&mut self, registry: &mio::Registry, client_token: Token, idx: usize) {
        self.fail_pending(registry, client_token, idx, true);
    }

    pub(crate) fn kick_session(&mut self, registry: &mio::Registry, token: Token) {
        if let Some(session) = self.sessions.get_mut(&token) {
            session.kick(registry);
        }
    }

    fn dispose_dead(&mut self, registry: &mio::Registry) {
        let dead: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.dead || s.should_dispose())
            .map(|(t, _)| *t)
            .collect();

        for token in dead {
            if let Some(mut session) = self.sessions.remove(&token) {
                debug!("tearing down session {:?} ({})", token, session.peer_addr);
                for up in session.upstreams.iter_mut() {
                    up.disconnect(registry);
                    self.endpoints.remove(&up.token);
                }
                let _ = registry.deregister(&mut session.stream);
                let _ = session.stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

fn apply_accepted_socket_options(stream: &TcpStream) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)
}

fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(50)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
