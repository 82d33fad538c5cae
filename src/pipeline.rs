//! Response pipeline: turns a `ParsedResponse` from an upstream into the
//! wire bytes a `ClientSession` writes back to its peer.
//!
//! Grounded on the origin-agnostic header-classification sweep the teacher
//! does in `HttpConnection::handle_post_write_update` (iterate, classify,
//! act), generalized here to the proxy's own classify/transform/assemble
//! steps instead of file-serving ones.

use crate::compress::{self, ContentEncoding};
use crate::headers::HeaderMap;
use crate::http::response::{assemble, status_line, ParsedResponse};

const MIN_TRANSFORM_BODY_LEN: usize = 100;
const GZIP_MIN_PERCENT: i64 = 75;
const IMAGE_QUALITY: u8 = 30;
const IMAGE_MIN_REDUCTION_PERCENT: u64 = 90;

/// Headers consumed by the pipeline itself rather than forwarded.
const CONSUMED: &[&str] = &["Transfer-Encoding", "Content-Length", "Connection"];
/// Hop-by-hop noise the origin sends that has no business reaching the client.
const DROPPED: &[&str] = &["Server", "X-Powered-By", "X-Cnection"];

pub struct Transformed {
    pub wire_bytes: Vec<u8>,
    /// The origin asked for its connection not to be reused.
    pub origin_close: bool,
}

/// Builds the client-visible response for a completed upstream exchange.
///
/// `client_read_closed` forces `Connection: close` onto the reply (the
/// client already told us, or we already told the client, that this is the
/// last response on the wire). `accept_encoding` is the *original* client
/// request's header, consulted for the compression negotiation.
pub fn process(
    response: ParsedResponse,
    accept_encoding: Option<&str>,
    client_read_closed: bool,
) -> Transformed {
    let mut headers = HeaderMap::new();
    let mut origin_close = false;

    for (key, value) in response.headers.iterate() {
        if CONSUMED.iter().any(|h| h.eq_ignore_ascii_case(key)) {
            if key.eq_ignore_ascii_case("Connection") && value.eq_ignore_ascii_case("close") {
                origin_close = true;
            }
            continue;
        }
        if DROPPED.iter().any(|h| h.eq_ignore_ascii_case(key)) {
            continue;
        }
        let _ = headers.add(key, value);
    }

    let content_type = response.headers.find("Content-Type").unwrap_or("").to_string();
    let already_encoded = response.headers.contains("Content-Encoding");

    let body = transform_body(response.body, &content_type, already_encoded, accept_encoding, &mut headers);

    if client_read_closed {
        let _ = headers.add("Connection", "close");
    }
    let _ = headers.add("Content-Length", &body.len().to_string());

    let line = status_line(response.major, response.minor, response.status_code, &response.reason);
    let wire_bytes = assemble(&line, &headers, &body);

    Transformed { wire_bytes, origin_close }
}

fn transform_body(
    body: Vec<u8>,
    content_type: &str,
    already_encoded: bool,
    accept_encoding: Option<&str>,
    headers: &mut HeaderMap,
) -> Vec<u8> {
    if body.len() <= MIN_TRANSFORM_BODY_LEN {
        return body;
    }

    let is_jpeg = content_type.eq_ignore_ascii_case("image/jpeg");
    let is_png = content_type.eq_ignore_ascii_case("image/png");

    if !already_encoded && !is_jpeg && !is_png {
        if let Some(accept) = accept_encoding {
            if let Some(encoding) = compress::preferred_encoding(accept) {
                let deflate_style = matches!(encoding, ContentEncoding::Deflate);
                if let Some(compressed) =
                    compress::gzip(&body, GZIP_MIN_PERCENT, deflate_style)
                {
                    let _ = headers.add("Content-Encoding", encoding.as_str());
                    return compressed;
                }
            }
        }
        return body;
    }

    if is_jpeg {
        if let Some(recompressed) = compress::jpeg_recompress(&body, IMAGE_QUALITY) {
            if meets_reduction_floor(recompressed.len(), body.len()) {
                return recompressed;
            }
        }
        return body;
    }

    if is_png {
        if let Some(recompressed) = compress::png_recompress(&body, IMAGE_QUALITY) {
            if meets_reduction_floor(recompressed.len(), body.len()) {
                return recompressed;
            }
        }
        return body;
    }

    body
}

fn meets_reduction_floor(new_len: usize, original_len: usize) -> bool {
    if original_len == 0 {
        return false;
    }
    100 * new_len as u64 <= IMAGE_MIN_REDUCTION_PERCENT * original_len as u64
}

/// Synthesizes a minimal response for cases the upstream never gets to
/// answer: an unsupported client method, or an upstream that failed before
/// any bytes of a real response existed.
pub fn synthesize(code: u16, reason: &str, close: bool) -> Vec<u8> {
    let mut headers = HeaderMap::new();
    if close {
        let _ = headers.add("Connection", "close");
    }
    let _ = headers.add("Content-Length", "0");
    let line = status_line(1, 1, code, reason);
    assemble(&line, &headers, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::ParsedResponse;

    fn parsed(body: Vec<u8>, content_type: &str) -> ParsedResponse {
        let mut headers = HeaderMap::new();
        headers.add("Content-Type", content_type).unwrap();
        ParsedResponse {
            major: 1,
            minor: 1,
            status_code: 200,
            reason: "OK".to_string(),
            headers,
            body,
        }
    }

    #[test]
    fn small_body_bypasses_transform_untouched() {
        let body = vec![b'A'; 50];
        let response = parsed(body.clone(), "text/plain");
        let out = process(response, Some("gzip, deflate"), false);
        let text = String::from_utf8(out.wire_bytes).unwrap();
        assert!(!text.contains("Content-Encoding"));
        assert!(text.contains("Content-Length: 50"));
        assert!(text.ends_with(&String::from_utf8(body).unwrap()));
    }

    #[test]
    fn large_text_body_prefers_deflate_when_both_offered() {
        let body = vec![b'A'; 512];
        let response = parsed(body, "text/plain");
        let out = process(response, Some("gzip, deflate"), false);
        let text_prefix =
            String::from_utf8_lossy(&out.wire_bytes[..out.wire_bytes.len().min(400)]).to_string();
        assert!(text_prefix.contains("Content-Encoding: deflate"));
    }

    #[test]
    fn connection_close_header_added_when_client_half_closed() {
        let response = parsed(vec![b'A'; 10], "text/plain");
        let out = process(response, None, true);
        let text = String::from_utf8(out.wire_bytes).unwrap();
        assert!(text.contains("Connection: close"));
    }

    #[test]
    fn origin_close_is_reported_but_not_forwarded() {
        let mut response = parsed(vec![b'A'; 10], "text/plain");
        response.headers.add("Connection", "close").unwrap();
        let out = process(response, None, false);
        let text = String::from_utf8(out.wire_bytes).unwrap();
        assert!(out.origin_close);
        // Connection: close appears once, from the client-half-closed path,
        // never echoing the origin's own value.
        assert!(!text.contains("Connection: close"));
    }

    #[test]
    fn synthesize_builds_minimal_response() {
        let bytes = synthesize(501, "Not Implemented", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
