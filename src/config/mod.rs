//! Configuration module for snapsched.

use crate::error::{Result, SnapschedError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings that bound a single reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// Ceiling on the total time one reconcile may spend on external calls.
    #[serde(with = "duration_serde")]
    pub reconcile_timeout: Duration,
    /// Fixed requeue delay returned after a reconcile error.
    #[serde(with = "duration_serde")]
    pub error_backoff: Duration,
    /// Smallest requeue delay ever returned.
    #[serde(with = "duration_serde")]
    pub min_requeue: Duration,
    /// Re-fetch attempts after a status update conflict.
    pub status_update_retries: u32,
    /// Maximum snapshot creations in flight per reconcile.
    pub max_concurrent_operations: usize,
    /// Field manager recorded on status writes.
    pub field_manager: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(60),
            error_backoff: Duration::from_secs(30),
            min_requeue: Duration::from_secs(1),
            status_update_retries: 3,
            max_concurrent_operations: 4,
            field_manager: "snapscheduler".to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapschedError::InvalidConfig {
                field: path.display().to_string(),
                reason: format!("failed to read config file: {}", e),
            }
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            SnapschedError::InvalidConfig {
                field: path.display().to_string(),
                reason: format!("failed to parse config: {}", e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_timeout.is_zero() {
            return Err(SnapschedError::InvalidConfig {
                field: "reconcileTimeout".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.error_backoff.is_zero() {
            return Err(SnapschedError::InvalidConfig {
                field: "errorBackoff".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.min_requeue.is_zero() {
            return Err(SnapschedError::InvalidConfig {
                field: "minRequeue".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.max_concurrent_operations == 0 {
            return Err(SnapschedError::InvalidConfig {
                field: "maxConcurrentOperations".to_string(),
                reason: "at least one operation must be allowed".to_string(),
            });
        }

        if self.field_manager.trim().is_empty() {
            return Err(SnapschedError::InvalidConfig {
                field: "fieldManager".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Parse a Go-style duration such as `168h`, `1h30m`, `90s` or `1.5h`.
///
/// Units: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = |reason: &str| SnapschedError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(invalid("negative durations are not allowed"));
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s.strip_prefix('+').unwrap_or(s);

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("invalid number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];

        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("duration out of range"));
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Render a duration in the same Go-style notation [`parse_duration`] accepts.
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    if duration.subsec_nanos() != 0 {
        return format!("{}ms", duration.as_millis());
    }

    let mut secs = duration.as_secs();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    out
}

/// Serde helper for Duration using Go-style duration strings.
pub mod duration_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.reconcile_timeout, Duration::from_secs(60));
        assert_eq!(config.status_update_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = ReconcilerConfig {
            reconcile_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ReconcilerConfig {
            max_concurrent_operations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("168h").unwrap(), Duration::from_secs(168 * 3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("-5m").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"reconcileTimeout": "2m", "errorBackoff": "10s", "statusUpdateRetries": 5}}"#
        )
        .unwrap();

        let config = ReconcilerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.reconcile_timeout, Duration::from_secs(120));
        assert_eq!(config.error_backoff, Duration::from_secs(10));
        assert_eq!(config.status_update_retries, 5);
        assert_eq!(config.max_concurrent_operations, 4);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reconcileTimeout": "0"}}"#).unwrap();
        assert!(ReconcilerConfig::from_file(file.path()).is_err());
    }
}
