//! TCP port probing and the allowed-port policy

use crate::config::MockConfig;
use crate::error::ControlError;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// How long a probe waits for a connection before calling the port free
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Check whether nothing is accepting connections on localhost:port.
///
/// A successful connect means the port is occupied. Refused connections,
/// other errors and timeouts all count as free; there is no retry.
pub async fn is_port_free(port: u16) -> bool {
    let connect =
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await;

    let free = !matches!(connect, Ok(Ok(_)));
    debug!(port, free, "Port probe");
    free
}

/// Which ports mock servers may be started on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPolicy {
    /// Bypass the range check entirely
    pub allow_any: bool,
    pub start: u16,
    pub end: u16,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            allow_any: false,
            start: 9001,
            end: 9999,
        }
    }
}

impl From<&MockConfig> for PortPolicy {
    fn from(config: &MockConfig) -> Self {
        Self {
            allow_any: config.allow_any_port,
            start: config.port_range_start,
            end: config.port_range_end,
        }
    }
}

impl PortPolicy {
    /// A policy that accepts any positive port
    pub fn unrestricted() -> Self {
        Self {
            allow_any: true,
            ..Self::default()
        }
    }

    pub fn is_allowed(&self, port: u16) -> bool {
        if self.allow_any {
            port > 0
        } else {
            (self.start..=self.end).contains(&port)
        }
    }

    /// Turn a port taken off the wire into a `u16` the policy accepts
    pub fn validate(&self, port: i64) -> Result<u16, ControlError> {
        let invalid = || ControlError::InvalidPort {
            port,
            start: if self.allow_any { 1 } else { self.start },
            end: if self.allow_any { u16::MAX } else { self.end },
        };

        let port = u16::try_from(port).map_err(|_| invalid())?;
        if self.is_allowed(port) {
            Ok(port)
        } else {
            Err(invalid())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_default_range() {
        let policy = PortPolicy::default();
        assert!(!policy.is_allowed(9000));
        assert!(policy.is_allowed(9001));
        assert!(policy.is_allowed(9999));
        assert!(!policy.is_allowed(10000));
        assert!(!policy.is_allowed(0));
    }

    #[test]
    fn test_unrestricted_accepts_any_positive_port() {
        let policy = PortPolicy::unrestricted();
        assert!(policy.is_allowed(1));
        assert!(policy.is_allowed(80));
        assert!(policy.is_allowed(65535));
        assert!(!policy.is_allowed(0));
    }

    #[test]
    fn test_validate_rejects_out_of_u16() {
        let policy = PortPolicy::unrestricted();
        assert!(matches!(
            policy.validate(-1),
            Err(ControlError::InvalidPort { port: -1, .. })
        ));
        assert!(matches!(
            policy.validate(70000),
            Err(ControlError::InvalidPort { port: 70000, .. })
        ));
        assert_eq!(policy.validate(8080).unwrap(), 8080);
    }

    #[test]
    fn test_validate_reports_range() {
        let err = PortPolicy::default().validate(3000).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid port 3000: port must be between 9001 and 9999"
        );
    }

    #[test]
    fn test_policy_from_mock_config() {
        let mut config = MockConfig::default();
        config.allow_any_port = true;
        config.port_range_start = 9100;
        config.port_range_end = 9200;

        let policy = PortPolicy::from(&config);
        assert!(policy.allow_any);
        assert_eq!(policy.start, 9100);
        assert_eq!(policy.end, 9200);
    }

    #[tokio::test]
    async fn test_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_free(port).await);

        drop(listener);
        assert!(is_port_free(port).await);
    }
}
