//! Centralized timing defaults.
//!
//! Size limits and per-request timeouts live in the YAML `limits` section;
//! the supervision timings below are process-level knobs read from the
//! environment.

use std::time::Duration;
use tracing::warn;

/// Supervision and shutdown timings shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDefaults {
    /// Interval of the orchestrator's backend health tick.
    pub health_check_interval: Duration,

    /// First frontend reconnect delay; doubles per failed attempt.
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the frontend reconnect delay.
    pub reconnect_max_delay: Duration,

    /// WebSocket keepalive ping interval.
    pub ping_interval: Duration,

    /// How long a child process gets to exit after stdin is closed.
    pub stdin_close_grace: Duration,

    /// How long a child process gets to exit after SIGTERM.
    pub sigterm_grace: Duration,
}

impl Default for GatewayDefaults {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(1),
            reconnect_initial_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            ping_interval: Duration::from_secs(20),
            stdin_close_grace: Duration::from_secs(5),
            sigterm_grace: Duration::from_secs(2),
        }
    }
}

impl GatewayDefaults {
    /// Create defaults from environment variables.
    ///
    /// # Environment Variables
    /// - `TOOLBRIDGE_HEALTH_CHECK_INTERVAL_MS`
    /// - `TOOLBRIDGE_RECONNECT_INITIAL_SECS`
    /// - `TOOLBRIDGE_RECONNECT_MAX_SECS`
    /// - `TOOLBRIDGE_PING_INTERVAL_SECS`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            health_check_interval: Duration::from_millis(parse_env_warn(
                "TOOLBRIDGE_HEALTH_CHECK_INTERVAL_MS",
                default.health_check_interval.as_millis() as u64,
            )),

            reconnect_initial_delay: Duration::from_secs(parse_env_warn(
                "TOOLBRIDGE_RECONNECT_INITIAL_SECS",
                default.reconnect_initial_delay.as_secs(),
            )),

            reconnect_max_delay: Duration::from_secs(parse_env_warn(
                "TOOLBRIDGE_RECONNECT_MAX_SECS",
                default.reconnect_max_delay.as_secs(),
            )),

            ping_interval: Duration::from_secs(parse_env_warn(
                "TOOLBRIDGE_PING_INTERVAL_SECS",
                default.ping_interval.as_secs(),
            )),

            // Not typically overridden
            stdin_close_grace: default.stdin_close_grace,
            sigterm_grace: default.sigterm_grace,
        }
    }

    /// Validate the defaults satisfy invariants.
    ///
    /// # Invariants
    /// 1. `reconnect_initial_delay` <= `reconnect_max_delay`
    /// 2. `health_check_interval` and `ping_interval` are non-zero
    pub fn validate(&self) -> Result<(), String> {
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err(format!(
                "reconnect_initial_delay ({:?}) must be <= reconnect_max_delay ({:?})",
                self.reconnect_initial_delay, self.reconnect_max_delay
            ));
        }

        if self.health_check_interval.is_zero() || self.ping_interval.is_zero() {
            return Err("health_check_interval and ping_interval must be non-zero".to_string());
        }

        Ok(())
    }
}

/// Parse an environment variable with a warning on invalid values.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let defaults = GatewayDefaults::default();

        assert_eq!(defaults.health_check_interval, Duration::from_secs(1));
        assert_eq!(defaults.reconnect_initial_delay, Duration::from_secs(5));
        assert_eq!(defaults.reconnect_max_delay, Duration::from_secs(60));
        assert_eq!(defaults.ping_interval, Duration::from_secs(20));
        assert_eq!(defaults.stdin_close_grace, Duration::from_secs(5));
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn test_defaults_validate_reconnect_bounds() {
        let defaults = GatewayDefaults {
            reconnect_initial_delay: Duration::from_secs(120),
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides_and_ignores_garbage() {
        unsafe {
            std::env::set_var("TOOLBRIDGE_RECONNECT_MAX_SECS", "90");
            std::env::set_var("TOOLBRIDGE_PING_INTERVAL_SECS", "soon");
        }
        let defaults = GatewayDefaults::from_env();
        assert_eq!(defaults.reconnect_max_delay, Duration::from_secs(90));
        assert_eq!(defaults.ping_interval, Duration::from_secs(20));
        unsafe {
            std::env::remove_var("TOOLBRIDGE_RECONNECT_MAX_SECS");
            std::env::remove_var("TOOLBRIDGE_PING_INTERVAL_SECS");
        }
    }
}
