use crate::error::UsageError;
use std::time::Duration;

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
/// Default dial timeout in seconds.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;
/// Default session lease TTL in seconds.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60;

/// Connection settings for the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// etcd endpoints (`http://host:port`).
    pub endpoints: Vec<String>,
    /// Bound on client construction and session establishment.
    pub dial_timeout: Duration,
    /// TTL of every session lease.
    pub session_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
        }
    }
}

impl ClientConfig {
    /// Build a config from raw option values.
    ///
    /// Blank endpoints are dropped; an empty list and sub-second durations
    /// are usage errors.
    pub fn new(
        endpoints: impl IntoIterator<Item = String>,
        dial_timeout_secs: u64,
        session_ttl_secs: u64,
    ) -> Result<Self, UsageError> {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(UsageError::NoEndpoints);
        }
        if dial_timeout_secs == 0 {
            return Err(UsageError::DurationTooShort {
                option: "dial-timeout",
                value: dial_timeout_secs,
            });
        }
        if session_ttl_secs == 0 {
            return Err(UsageError::DurationTooShort {
                option: "ttl",
                value: session_ttl_secs,
            });
        }
        Ok(Self {
            endpoints,
            dial_timeout: Duration::from_secs(dial_timeout_secs),
            session_ttl: Duration::from_secs(session_ttl_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_endpoints_are_dropped() -> anyhow::Result<()> {
        let cfg = ClientConfig::new(
            vec![" http://a:2379 ".to_string(), String::new()],
            5,
            60,
        )?;
        assert_eq!(cfg.endpoints, vec!["http://a:2379".to_string()]);
        assert_eq!(cfg.session_ttl, Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn rejects_empty_endpoints_and_zero_durations() {
        assert_eq!(
            ClientConfig::new(vec![" ".to_string()], 5, 60),
            Err(UsageError::NoEndpoints)
        );
        assert_eq!(
            ClientConfig::new(vec![DEFAULT_ENDPOINT.to_string()], 5, 0),
            Err(UsageError::DurationTooShort {
                option: "ttl",
                value: 0
            })
        );
        assert!(ClientConfig::new(vec![DEFAULT_ENDPOINT.to_string()], 0, 60).is_err());
    }
}
