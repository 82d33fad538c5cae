//! The session's ordered message queue.
//!
//! The original mixes `http_request` and `http_response` structs in one
//! linked list via a shared `http_message` envelope (tag + list node) and
//! explicitly avoids reaching for inheritance to do it. The direct Rust
//! translation of "tagged envelope, no inheritance" is an enum: a session's
//! queue is a `VecDeque<Slot>`, where a `Slot::Request` is a placeholder
//! for a reply still in flight and a `Slot::Response` carries the fully
//! assembled wire bytes once the pipeline has produced them.
//!
//! The original inserts the Response node immediately after its Request
//! node and then frees the Request once the pipeline finishes. Since every
//! request here produces at most one response (upstream pipelining is not
//! used, per the session invariant), that two-step dance collapses to an
//! in-place replacement at the same queue position, which is what
//! `ClientSession::complete_request` below does.

/// Identifies a request slot across its lifetime from tokenization to
/// response delivery. Monotonically increasing per session.
pub type RequestId = u64;

#[derive(Debug)]
pub enum Slot {
    /// A request has been parsed and handed to an upstream connection, but
    /// no response bytes exist yet.
    Request(RequestId),
    Response(ResponseMessage),
}

impl Slot {
    pub fn request_id(&self) -> RequestId {
        match self {
            Slot::Request(id) => *id,
            Slot::Response(r) => r.request_id,
        }
    }
}

#[derive(Debug)]
pub struct ResponseMessage {
    pub request_id: RequestId,
    /// Full wire form: status line + headers + blank line + body.
    pub bytes: Vec<u8>,
    /// Transitions false -> true exactly once, after the owning request is
    /// fully processed by the response pipeline.
    pub ready_to_go: bool,
    /// Set when this response should be the last thing written before the
    /// session tears itself down (client requested `Connection: close`,
    /// the request was unsupported, or the upstream failed terminally).
    pub close_after: bool,
}

impl ResponseMessage {
    pub fn new(request_id: RequestId, bytes: Vec<u8>, close_after: bool) -> Self {
        ResponseMessage { request_id, bytes, ready_to_go: true, close_after }
    }
}
