//! Case-insensitive, order-preserving header list.
//!
//! The teacher's request parser keeps headers in a `HashMap`, which is fine
//! for a web server that only ever looks a header up by name. A proxy has to
//! forward the *other* headers too, byte-for-byte in the order the origin
//! sent them, so this keeps an ordered `Vec` instead and does the
//! case-insensitive comparisons by hand at lookup time.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    InvalidValue,
    InvalidName,
    Malformed,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::InvalidValue => write!(f, "header value contains CR or LF"),
            HeaderError::InvalidName => write!(f, "header name contains whitespace"),
            HeaderError::Malformed => write!(f, "malformed header line"),
        }
    }
}

impl std::error::Error for HeaderError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        HeaderMap { entries: Vec::new() }
    }

    pub fn add(&mut self, key: &str, value: &str) -> Result<(), HeaderError> {
        if key.chars().any(|c| c.is_whitespace()) || key.is_empty() {
            return Err(HeaderError::InvalidName);
        }
        if value.bytes().any(|b| b == b'\r' || b == b'\n') {
            return Err(HeaderError::InvalidValue);
        }
        self.entries.push((key.to_string(), value.to_string()));
        Ok(())
    }

    pub fn find(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(pos).1)
    }

    /// Removes every entry whose key matches `keys` case-insensitively.
    pub fn remove_all(&mut self, keys: &[&str]) {
        self.entries
            .retain(|(k, _)| !keys.iter().any(|blocked| k.eq_ignore_ascii_case(blocked)));
    }

    pub fn iterate(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses a header block (everything up to and including the blank
    /// line) out of `bytes`, returning the map and the number of bytes
    /// consumed. Tolerates extra leading CRLF pairs between pipelined
    /// messages, per the wire-protocol note in the request tokenizer.
    pub fn parse(bytes: &[u8]) -> Result<(HeaderMap, usize), HeaderError> {
        let mut map = HeaderMap::new();
        let mut cursor = 0usize;

        // Tolerate leading blank lines (stray CRLFs some origins emit
        // between pipelined responses).
        while bytes[cursor..].starts_with(b"\r\n") {
            cursor += 2;
        }

        loop {
            let rest = &bytes[cursor..];
            let line_end = find_crlf(rest).ok_or(HeaderError::Malformed)?;
            if line_end == 0 {
                cursor += 2;
                break;
            }
            let line = std::str::from_utf8(&rest[..line_end]).map_err(|_| HeaderError::Malformed)?;
            let sep = line.find(':').ok_or(HeaderError::Malformed)?;
            let key = line[..sep].trim_end();
            let mut value = &line[sep + 1..];
            if let Some(stripped) = value.strip_prefix(' ') {
                value = stripped;
            }
            map.add(key, value)?;
            cursor += line_end + 2;
        }

        Ok((map, cursor))
    }

    /// Serializes to wire form: `Key: value\r\n` per entry, no trailing
    /// blank line (callers append the blank line themselves once the rest
    /// of the response/request is assembled).
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        for (k, v) in &self.entries {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Header names scoped to a single hop that a proxy must never forward,
/// client → upstream direction. Order mirrors the original's blocked set.
pub const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Public",
    "Proxy-Authenticate",
    "Transfer-Encoding",
    "Upgrade",
    "Accept-Encoding",
    "Range",
    "Proxy-Connection",
    "Proxy-Authorization",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_crlf_in_value() {
        let mut h = HeaderMap::new();
        assert_eq!(h.add("X-Evil", "a\r\nSet-Cookie: x").unwrap_err(), HeaderError::InvalidValue);
    }

    #[test]
    fn find_is_case_insensitive_and_returns_first() {
        let mut h = HeaderMap::new();
        h.add("Host", "example.test").unwrap();
        h.add("host", "second").unwrap();
        assert_eq!(h.find("HOST"), Some("example.test"));
    }

    #[test]
    fn parse_splits_on_first_colon_and_trims_one_space() {
        let raw = b"Host: example.test\r\nX-Multi: a: b\r\n\r\n";
        let (map, consumed) = HeaderMap::parse(raw).unwrap();
        assert_eq!(map.find("Host"), Some("example.test"));
        assert_eq!(map.find("X-Multi"), Some("a: b"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn parse_tolerates_leading_blank_lines() {
        let raw = b"\r\n\r\nHost: x\r\n\r\n";
        let (map, _) = HeaderMap::parse(raw).unwrap();
        assert_eq!(map.find("Host"), Some("x"));
    }

    #[test]
    fn round_trip_parse_serialize() {
        let mut h = HeaderMap::new();
        h.add("Host", "example.test").unwrap();
        h.add("Accept", "*/*").unwrap();
        let mut bytes = Vec::new();
        h.serialize_into(&mut bytes);
        bytes.extend_from_slice(b"\r\n");
        let (parsed, _) = HeaderMap::parse(&bytes).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn remove_all_strips_hop_by_hop_and_is_idempotent_under_reparse() {
        let mut h = HeaderMap::new();
        h.add("Connection", "keep-alive").unwrap();
        h.add("Host", "x").unwrap();
        h.add("Proxy-Authorization", "secret").unwrap();
        h.remove_all(HOP_BY_HOP);
        let mut bytes = Vec::new();
        h.serialize_into(&mut bytes);
        bytes.extend_from_slice(b"\r\n");
        let (reparsed, _) = HeaderMap::parse(&bytes).unwrap();
        for blocked in HOP_BY_HOP {
            assert!(reparsed.find(blocked).is_none());
        }
        assert_eq!(reparsed.find("Host"), Some("x"));
    }
}
