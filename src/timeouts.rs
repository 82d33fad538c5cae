//! Periodic deadline sweep, run once per event-loop tick.
//!
//! Mirrors the teacher's `timeouts::process` shape (walk live connections,
//! tear down anything past its deadline) but swept structures are sessions
//! and their upstreams instead of `HttpConnection`/CGI children.

use crate::server::Server;
use proxy_log::debug;
use std::time::{Duration, Instant};

const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub fn sweep(server: &mut Server, registry: &mio::Registry) {
    let now = Instant::now();

    for (token, peer_addr) in server.idle_sessions(now, CLIENT_IDLE_TIMEOUT) {
        debug!("client {} idle past {:?}, tearing down", peer_addr, CLIENT_IDLE_TIMEOUT);
        server.mark_dead(token);
    }

    // §7: a Timeout retries with backoff exactly like a ConnectError, not
    // an immediate drain -- a host that never answers the SYN (no RST, no
    // SYN-ACK) only ever shows up here, never through a synchronous
    // connect() error, so this is the only place that failure mode gets a
    // retry budget at all.
    for (token, idx, host, port) in server.timed_out_upstreams(now) {
        debug!("upstream {}:{} timed out, retrying with backoff", host, port);
        server.fail_upstream_timeout(registry, token, idx);
    }

    for token in server.session_tokens() {
        server.kick_session(registry, token);
    }
}
