//! Runtime defaults that are not part of the configuration file.

use std::time::Duration;
use tracing::warn;

/// Process-level knobs, overridable from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaygateDefaults {
    /// Maximum time for graceful shutdown: the drain plus releasing every
    /// policy tree.
    pub shutdown_timeout: Duration,

    /// Time given to in-flight exchanges during shutdown. Must be less than
    /// `shutdown_timeout`.
    pub drain_timeout: Duration,

    /// Pause between pre-send retries of a queue routing attempt.
    pub queue_retry_delay: Duration,
}

impl Default for RelaygateDefaults {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(25),
            queue_retry_delay: Duration::from_millis(1000),
        }
    }
}

impl RelaygateDefaults {
    /// Read overrides from the environment. Invalid values are logged and
    /// replaced by the default.
    ///
    /// # Environment Variables
    /// - `RELAYGATE_SHUTDOWN_TIMEOUT_SECS`
    /// - `RELAYGATE_DRAIN_TIMEOUT_SECS`
    /// - `RELAYGATE_QUEUE_RETRY_DELAY_MS`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "RELAYGATE_SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),

            drain_timeout: Duration::from_secs(parse_env_warn(
                "RELAYGATE_DRAIN_TIMEOUT_SECS",
                default.drain_timeout.as_secs(),
            )),

            queue_retry_delay: Duration::from_millis(parse_env_warn(
                "RELAYGATE_QUEUE_RETRY_DELAY_MS",
                default.queue_retry_delay.as_millis() as u64,
            )),
        }
    }

    /// Time left for releasing policy trees once the drain has used its
    /// share of `shutdown_timeout`.
    pub fn release_budget(&self) -> Duration {
        self.shutdown_timeout.saturating_sub(self.drain_timeout)
    }

    /// # Errors
    ///
    /// Describes the first violated invariant: `drain_timeout` must be less
    /// than `shutdown_timeout`.
    pub fn validate(&self) -> Result<(), String> {
        if self.drain_timeout >= self.shutdown_timeout {
            return Err(format!(
                "drain_timeout ({:?}) must be less than shutdown_timeout ({:?})",
                self.drain_timeout, self.shutdown_timeout
            ));
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

    struct EnvVarGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvVarGuard {
        fn new(var_names: &[&'static str]) -> Self {
            let vars = var_names
                .iter()
                .map(|&name| (name, std::env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            for (name, original) in &self.vars {
                // SAFETY: single-threaded test context (enforced by #[serial])
                unsafe {
                    match original {
                        Some(val) => std::env::set_var(name, val),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    const VARS: &[&str] = &[
        "RELAYGATE_SHUTDOWN_TIMEOUT_SECS",
        "RELAYGATE_DRAIN_TIMEOUT_SECS",
        "RELAYGATE_QUEUE_RETRY_DELAY_MS",
    ];

    #[test]
    fn test_defaults() {
        let defaults = RelaygateDefaults::default();
        assert_eq!(defaults.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(defaults.queue_retry_delay, Duration::from_millis(1000));
        assert!(defaults.validate().is_ok());
        assert_eq!(defaults.release_budget(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_drain_timeout() {
        let defaults = RelaygateDefaults {
            drain_timeout: Duration::from_secs(35),
            ..Default::default()
        };
        assert!(defaults.validate().is_err());
        assert_eq!(defaults.release_budget(), Duration::ZERO);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        let _guard = EnvVarGuard::new(VARS);
        // SAFETY: single-threaded test context (enforced by #[serial])
        unsafe {
            std::env::set_var("RELAYGATE_QUEUE_RETRY_DELAY_MS", "250");
            std::env::set_var("RELAYGATE_SHUTDOWN_TIMEOUT_SECS", "60");
            std::env::remove_var("RELAYGATE_DRAIN_TIMEOUT_SECS");
        }
        let defaults = RelaygateDefaults::from_env();
        assert_eq!(defaults.queue_retry_delay, Duration::from_millis(250));
        assert_eq!(defaults.shutdown_timeout, Duration::from_secs(60));
        assert_eq!(defaults.drain_timeout, Duration::from_secs(25));
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_falls_back() {
        let _guard = EnvVarGuard::new(VARS);
        // SAFETY: single-threaded test context (enforced by #[serial])
        unsafe {
            std::env::set_var("RELAYGATE_QUEUE_RETRY_DELAY_MS", "soon");
        }
        let defaults = RelaygateDefaults::from_env();
        assert_eq!(defaults.queue_retry_delay, Duration::from_millis(1000));
    }
}
