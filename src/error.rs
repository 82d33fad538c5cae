use std::fmt;
use thiserror::Error;

/// Crate-wide error taxonomy. Variants line up with the failure classes a
/// connection or session can recover from locally; nothing here is meant to
/// reach the event loop itself.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("upstream connect failed: {0}")]
    Connect(String),

    #[error("timed out waiting for progress")]
    Timeout,

    #[error("unexpected end of stream")]
    Eof,

    #[error("compression aborted: ratio not worth it")]
    CompressionAborted,

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Wraps a `ProxyError` for top-level (process-boundary) reporting with the
/// same colored one-line rendering the rest of this codebase's diagnostics use.
pub struct CleanError(pub ProxyError);

impl fmt::Debug for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\r\x1b[K{}", self)
    }
}

impl fmt::Display for CleanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\x1b[31mERROR\x1b[0m: {}", self.0)
    }
}

impl std::error::Error for CleanError {}

impl From<ProxyError> for CleanError {
    fn from(e: ProxyError) -> Self {
        CleanError(e)
    }
}

impl From<std::io::Error> for CleanError {
    fn from(e: std::io::Error) -> Self {
        CleanError(ProxyError::Io(e))
    }
}
