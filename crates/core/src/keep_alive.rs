//! Keep-alive durations for resident models.
//!
//! A keep-alive is written as `"<N>m"` (N minutes). The literal `"0"` (or the
//! number `0`) asks for the model to be evicted right away without loading it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeepAliveError {
    #[error("invalid keep_alive value '{0}': expected '<minutes>m' or 0")]
    Malformed(String),
}

/// How long a model stays resident after the request that touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// Evict now, never load.
    Unload,
    /// Stay resident for at least this long.
    For(Duration),
}

impl KeepAlive {
    pub fn parse(value: &str) -> Result<Self, KeepAliveError> {
        let value = value.trim();
        if value == "0" {
            return Ok(KeepAlive::Unload);
        }

        let minutes = value
            .strip_suffix('m')
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| KeepAliveError::Malformed(value.to_string()))?;

        Self::minutes(minutes).ok_or_else(|| KeepAliveError::Malformed(value.to_string()))
    }

    /// `None` when the minutes do not fit in a `Duration`'s seconds.
    pub fn minutes(minutes: u64) -> Option<Self> {
        if minutes == 0 {
            return Some(KeepAlive::Unload);
        }
        let secs = minutes.checked_mul(60)?;
        Some(KeepAlive::For(Duration::from_secs(secs)))
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            KeepAlive::Unload => None,
            KeepAlive::For(ttl) => Some(*ttl),
        }
    }
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepAlive::Unload => write!(f, "0"),
            KeepAlive::For(ttl) => write!(f, "{}m", ttl.as_secs() / 60),
        }
    }
}

/// Keep-alive as it appears on the wire: either a string or a bare number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepAliveInput {
    Number(i64),
    Text(String),
}

impl KeepAliveInput {
    pub fn resolve(&self) -> Result<KeepAlive, KeepAliveError> {
        match self {
            KeepAliveInput::Number(0) => Ok(KeepAlive::Unload),
            KeepAliveInput::Number(n) => Err(KeepAliveError::Malformed(n.to_string())),
            KeepAliveInput::Text(text) => KeepAlive::parse(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes() {
        assert_eq!(
            KeepAlive::parse("5m").unwrap(),
            KeepAlive::For(Duration::from_secs(300))
        );
        assert_eq!(KeepAlive::parse("5m").unwrap().to_string(), "5m");
    }

    #[test]
    fn zero_means_unload() {
        assert_eq!(KeepAlive::parse("0").unwrap(), KeepAlive::Unload);
        assert_eq!(KeepAlive::parse("0m").unwrap(), KeepAlive::Unload);
        assert_eq!(KeepAliveInput::Number(0).resolve().unwrap(), KeepAlive::Unload);
    }

    #[test]
    fn rejects_other_formats() {
        for bad in ["5s", "m", "", "five m", "-3m", "1h"] {
            assert!(KeepAlive::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(KeepAliveInput::Number(7).resolve().is_err());
    }

    #[test]
    fn huge_minutes_are_malformed_not_a_panic() {
        assert_eq!(
            KeepAlive::parse("400000000000000000m"),
            Err(KeepAliveError::Malformed("400000000000000000m".to_string()))
        );
        assert!(KeepAlive::minutes(u64::MAX).is_none());
        // Large but representable values still parse.
        assert!(KeepAlive::parse("300000000000000000m").is_ok());
    }

    #[test]
    fn wire_forms_deserialize() {
        let text: KeepAliveInput = serde_json::from_str("\"10m\"").unwrap();
        assert_eq!(
            text.resolve().unwrap(),
            KeepAlive::For(Duration::from_secs(600))
        );
        let number: KeepAliveInput = serde_json::from_str("0").unwrap();
        assert_eq!(number, KeepAliveInput::Number(0));
    }
}
