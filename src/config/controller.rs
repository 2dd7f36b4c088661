//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Port of the metrics/probe/admission server
    pub metrics_port: u16,
    /// Delay before looking at a missing or not-ready prerequisite again (seconds)
    pub not_ready_requeue_secs: u64,
    /// Fallback requeue when the backoff state cannot be read (seconds)
    pub reconciliation_error_requeue_secs: u64,
    /// Fibonacci backoff lower bound (minutes)
    pub backoff_min_minutes: u64,
    /// Fibonacci backoff upper bound (minutes)
    pub backoff_max_minutes: u64,
    /// Namespace to watch, empty for all namespaces
    pub watch_namespace: String,
    /// Image defaulted into KeystoneAPI objects that do not set one
    pub default_container_image: String,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Timeout of one identity backend request (seconds)
    pub identity_request_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: DEFAULT_METRICS_PORT,
            not_ready_requeue_secs: DEFAULT_NOT_READY_REQUEUE_SECS,
            reconciliation_error_requeue_secs: DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
            backoff_min_minutes: DEFAULT_BACKOFF_MIN_MINUTES,
            backoff_max_minutes: DEFAULT_BACKOFF_MAX_MINUTES,
            watch_namespace: String::new(),
            default_container_image: DEFAULT_KEYSTONE_API_IMAGE.to_string(),
            log_level: "INFO".to_string(),
            identity_request_timeout_secs: DEFAULT_IDENTITY_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            not_ready_requeue_secs: env_var_or_default(
                "NOT_READY_REQUEUE_SECS",
                DEFAULT_NOT_READY_REQUEUE_SECS,
            ),
            reconciliation_error_requeue_secs: env_var_or_default(
                "RECONCILIATION_ERROR_REQUEUE_SECS",
                DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
            ),
            backoff_min_minutes: env_var_or_default(
                "BACKOFF_MIN_MINUTES",
                DEFAULT_BACKOFF_MIN_MINUTES,
            ),
            backoff_max_minutes: env_var_or_default(
                "BACKOFF_MAX_MINUTES",
                DEFAULT_BACKOFF_MAX_MINUTES,
            ),
            watch_namespace: env_var_or_default_str("WATCH_NAMESPACE", ""),
            default_container_image: env_var_or_default_str(
                KEYSTONE_API_IMAGE_ENV,
                DEFAULT_KEYSTONE_API_IMAGE,
            ),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            identity_request_timeout_secs: env_var_or_default(
                "IDENTITY_REQUEST_TIMEOUT_SECS",
                DEFAULT_IDENTITY_REQUEST_TIMEOUT_SECS,
            ),
        }
    }

    /// Requeue used by the dependency gate while waiting on a prerequisite
    pub fn not_ready_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.not_ready_requeue_secs)
    }

    /// Get reconciliation error requeue duration
    pub fn reconciliation_error_requeue_duration(&self) -> Duration {
        Duration::from_secs(self.reconciliation_error_requeue_secs)
    }

    /// Get identity request timeout
    pub fn identity_request_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_request_timeout_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_constants() {
        let config = ControllerConfig::default();
        assert_eq!(config.not_ready_requeue_duration(), Duration::from_secs(5));
        assert_eq!(config.backoff_min_minutes, 1);
        assert_eq!(config.backoff_max_minutes, 10);
        assert!(config.watch_namespace.is_empty());
        assert!(config.default_container_image.contains("openstack-keystone"));
    }

    #[test]
    fn test_unparseable_value_falls_back() {
        assert_eq!(
            env_var_or_default("KEYSTONE_OPERATOR_TEST_UNSET_VALUE", 42u64),
            42
        );
    }
}
