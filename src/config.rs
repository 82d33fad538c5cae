//! Command-line surface. The proxy takes no config file; every knob is a
//! flag, parsed once at startup with `clap`'s derive API the way the
//! teacher's config layer was meant to wire CLI-level concerns (the YAML
//! route/server blocks it also carried have no equivalent here).
//!
//! `--verbose`/`--debug` both accept either a bare repeated flag (`-v -v`,
//! increment) or an explicit level (`--verbose=3`, set), mirroring
//! `opts.c`'s `OPT_VERBOSE`/`OPT_DEBUG` handling: `clap::ArgAction::Count`
//! alone can't express "or an explicit value", so the raw occurrences are
//! collected as strings and resolved by hand in `Options::parse`.

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "packsaver", about = "Bandwidth-saving HTTP/1.x forward proxy")]
struct RawOptions {
    /// Port to listen on, 1..32768.
    #[arg(long, default_value_t = 7001)]
    port: u16,

    /// Increase logging verbosity. Repeat for more (-v, -vv, -vvv), or pass
    /// an explicit level (--verbose=3).
    #[arg(
        short,
        long,
        num_args = 0..=1,
        default_missing_value = "",
        action = clap::ArgAction::Append
    )]
    verbose: Vec<String>,

    /// Internal diagnostics level. Not part of the supported surface.
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "",
        action = clap::ArgAction::Append,
        hide = true
    )]
    debug: Vec<String>,

    /// Maximum connect retries per upstream before the head request fails.
    #[arg(long, default_value_t = 20)]
    retry_max: u32,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub port: u16,
    pub verbose: u8,
    pub debug: u8,
    pub retry_max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl Options {
    /// Parses the process's command line. A bare occurrence of `-v`/
    /// `--verbose`/`--debug` increments the level by one per occurrence; an
    /// explicit `--verbose=N` sets it outright, taking the last explicit
    /// value given.
    pub fn parse() -> Self {
        let raw = RawOptions::parse();
        Options {
            port: raw.port,
            verbose: resolve_level(&raw.verbose),
            debug: resolve_level(&raw.debug),
            retry_max: raw.retry_max,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 || self.port >= 32768 {
            return Err(ConfigError(format!(
                "--port must be in 1..32768, got {}",
                self.port
            )));
        }
        Ok(())
    }
}

/// Resolves a flag's raw occurrences (one empty string per bare occurrence,
/// a numeric string per explicit `=N`) into a level: the last explicit
/// value if any occurrence carried one, otherwise the occurrence count.
fn resolve_level(occurrences: &[String]) -> u8 {
    match occurrences.iter().rev().find(|s| !s.is_empty()) {
        Some(explicit) => explicit.parse().unwrap_or(0),
        None => occurrences.len() as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(port: u16) -> Options {
        Options { port, verbose: 0, debug: 0, retry_max: 20 }
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(opts(0).validate().is_err());
    }

    #[test]
    fn port_at_upper_bound_is_rejected() {
        assert!(opts(32768).validate().is_err());
    }

    #[test]
    fn default_port_is_valid() {
        assert!(opts(7001).validate().is_ok());
    }

    #[test]
    fn resolve_level_counts_bare_occurrences() {
        let occurrences = vec!["".to_string(), "".to_string(), "".to_string()];
        assert_eq!(resolve_level(&occurrences), 3);
    }

    #[test]
    fn resolve_level_prefers_last_explicit_value() {
        let occurrences = vec!["".to_string(), "5".to_string(), "".to_string()];
        assert_eq!(resolve_level(&occurrences), 5);
    }

    #[test]
    fn resolve_level_defaults_to_zero_when_absent() {
        assert_eq!(resolve_level(&[]), 0);
    }
}
