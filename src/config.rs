//! Configuration module for devwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::monitor::MonitorSettings;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite history database (default: "device_logs.db")
    pub db_path: String,
    /// Device list file (default: "devices.txt")
    pub devices_path: String,
    /// Persisted history logging flag (default: "logging_state.txt")
    pub logging_state_path: String,
    /// Seconds between poll cycles (default: 3)
    pub poll_interval_secs: u64,
    /// Per-probe deadline in seconds (default: 2)
    pub probe_timeout_secs: u64,
    /// Upper bound on probes in flight (default: 64)
    pub max_concurrent_probes: usize,
    /// Log every observation, not just transitions (default: false)
    pub log_samples: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "device_logs.db".to_string(),
            devices_path: "devices.txt".to_string(),
            logging_state_path: "logging_state.txt".to_string(),
            poll_interval_secs: 3,
            probe_timeout_secs: 2,
            max_concurrent_probes: 64,
            log_samples: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DEVWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `DEVWATCH_DB_PATH`: Database file path (default: "device_logs.db")
    /// - `DEVWATCH_DEVICES_PATH`: Device list file (default: "devices.txt")
    /// - `DEVWATCH_LOGGING_STATE_PATH`: Logging flag file (default: "logging_state.txt")
    /// - `DEVWATCH_POLL_INTERVAL`: Poll interval in seconds (default: 3)
    /// - `DEVWATCH_PROBE_TIMEOUT`: Probe timeout in seconds (default: 2)
    /// - `DEVWATCH_MAX_CONCURRENT_PROBES`: Probe concurrency (default: 64)
    /// - `DEVWATCH_LOG_SAMPLES`: "true" to log steady-state samples (default: false)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_positive::<u16>(lookup("DEVWATCH_HTTP_PORT")) {
            cfg.http_port = port;
        }
        if let Some(path) = non_empty(lookup("DEVWATCH_DB_PATH")) {
            cfg.db_path = path;
        }
        if let Some(path) = non_empty(lookup("DEVWATCH_DEVICES_PATH")) {
            cfg.devices_path = path;
        }
        if let Some(path) = non_empty(lookup("DEVWATCH_LOGGING_STATE_PATH")) {
            cfg.logging_state_path = path;
        }
        if let Some(secs) = parse_positive::<u64>(lookup("DEVWATCH_POLL_INTERVAL")) {
            cfg.poll_interval_secs = secs;
        }
        if let Some(secs) = parse_positive::<u64>(lookup("DEVWATCH_PROBE_TIMEOUT")) {
            cfg.probe_timeout_secs = secs;
        }
        if let Some(n) = parse_positive::<usize>(lookup("DEVWATCH_MAX_CONCURRENT_PROBES")) {
            cfg.max_concurrent_probes = n;
        }
        if let Some(flag) = lookup("DEVWATCH_LOG_SAMPLES") {
            cfg.log_samples = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        cfg
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            max_concurrent_probes: self.max_concurrent_probes,
            log_samples: self.log_samples,
        }
    }
}

/// Zero and unparsable values fall back to the default.
fn parse_positive<T: FromStr + PartialOrd + Default>(value: Option<String>) -> Option<T> {
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "device_logs.db");
        assert_eq!(cfg.devices_path, "devices.txt");
        assert_eq!(cfg.logging_state_path, "logging_state.txt");
        assert_eq!(cfg.poll_interval_secs, 3);
        assert_eq!(cfg.probe_timeout_secs, 2);
        assert!(!cfg.log_samples);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load_from(&[
            ("DEVWATCH_HTTP_PORT", "9090"),
            ("DEVWATCH_DB_PATH", "/var/lib/devwatch/history.db"),
            ("DEVWATCH_POLL_INTERVAL", "10"),
            ("DEVWATCH_PROBE_TIMEOUT", "4"),
            ("DEVWATCH_MAX_CONCURRENT_PROBES", "8"),
            ("DEVWATCH_LOG_SAMPLES", "true"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.db_path, "/var/lib/devwatch/history.db");
        assert_eq!(cfg.devices_path, "devices.txt");

        let settings = cfg.monitor_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.probe_timeout, Duration::from_secs(4));
        assert_eq!(settings.max_concurrent_probes, 8);
        assert!(settings.log_samples);
    }

    #[test]
    fn test_invalid_values_use_defaults() {
        let cfg = load_from(&[
            ("DEVWATCH_HTTP_PORT", "not-a-port"),
            ("DEVWATCH_POLL_INTERVAL", "0"),
            ("DEVWATCH_PROBE_TIMEOUT", "-2"),
            ("DEVWATCH_MAX_CONCURRENT_PROBES", ""),
            ("DEVWATCH_DB_PATH", "  "),
        ]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.poll_interval_secs, 3);
        assert_eq!(cfg.probe_timeout_secs, 2);
        assert_eq!(cfg.max_concurrent_probes, 64);
        assert_eq!(cfg.db_path, "device_logs.db");
    }
}
