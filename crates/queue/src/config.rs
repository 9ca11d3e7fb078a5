use std::time::Duration;

use peerwork_core::error::CoreError;
use peerwork_core::node::validate_hostname;
use peerwork_core::scheduling::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LOAD_REPORT_INTERVAL, DEFAULT_PROCESSING_TIMEOUT,
    DEFAULT_RECOVERY_PERIOD,
};

/// Default peer RPC port.
pub const DEFAULT_PEER_PORT: u16 = 7654;

/// Default endpoint local worker processes connect to.
pub const DEFAULT_WORKER_ADDR: &str = "127.0.0.1:7655";

/// Default number of in-flight calls a single worker may carry.
pub const DEFAULT_MAX_LOAD_PER_WORKER: u64 = 5;

/// Default timeout for dialling a peer.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinator configuration.
///
/// All fields have defaults suitable for a single-host deployment; override
/// them through the environment with [`QueueConfig::from_env`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name written to the node registry and dialled by peers.
    pub hostname: String,
    /// Interface the peer listener binds to.
    pub bind_host: String,
    /// Peer listener port; `0` binds an ephemeral port.
    pub peer_port: u16,
    /// Endpoint for local workers; `None` disables the local pool.
    pub worker_addr: Option<String>,
    pub max_load_per_worker: u64,
    /// Age past `not_before` after which a row counts as lost.
    pub processing_timeout: Duration,
    pub recovery_period: Duration,
    pub heartbeat_interval: Duration,
    pub load_report_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            bind_host: "0.0.0.0".into(),
            peer_port: DEFAULT_PEER_PORT,
            worker_addr: Some(DEFAULT_WORKER_ADDR.into()),
            max_load_per_worker: DEFAULT_MAX_LOAD_PER_WORKER,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            recovery_period: DEFAULT_RECOVERY_PERIOD,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            load_report_interval: DEFAULT_LOAD_REPORT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                      |
    /// |------------------------------------|------------------------------|
    /// | `PEERWORK_HOSTNAME`                | `$HOSTNAME` or `localhost`   |
    /// | `PEERWORK_BIND_HOST`               | `0.0.0.0`                    |
    /// | `PEERWORK_PEER_PORT`               | `7654`                       |
    /// | `PEERWORK_WORKER_ADDR`             | `127.0.0.1:7655` (empty = off) |
    /// | `PEERWORK_MAX_LOAD_PER_WORKER`     | `5`                          |
    /// | `PEERWORK_PROCESSING_TIMEOUT_SECS` | `600`                        |
    /// | `PEERWORK_RECOVERY_PERIOD_SECS`    | `60`                         |
    /// | `PEERWORK_HEARTBEAT_SECS`          | `30`                         |
    /// | `PEERWORK_LOAD_REPORT_SECS`        | `5`                          |
    /// | `PEERWORK_CONNECT_TIMEOUT_SECS`    | `5`                          |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let hostname = lookup("PEERWORK_HOSTNAME")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or(defaults.hostname);
        validate_hostname(&hostname)?;

        let bind_host = lookup("PEERWORK_BIND_HOST").unwrap_or(defaults.bind_host);

        let worker_addr = match lookup("PEERWORK_WORKER_ADDR") {
            Some(addr) if addr.trim().is_empty() => None,
            Some(addr) => Some(addr.trim().to_string()),
            None => defaults.worker_addr,
        };

        let max_load_per_worker =
            parse_or(&lookup, "PEERWORK_MAX_LOAD_PER_WORKER", defaults.max_load_per_worker)?;
        if max_load_per_worker == 0 {
            return Err(CoreError::Validation(
                "PEERWORK_MAX_LOAD_PER_WORKER must be at least 1".to_string(),
            ));
        }

        let recovery_period = secs_or(
            &lookup,
            "PEERWORK_RECOVERY_PERIOD_SECS",
            defaults.recovery_period,
        )?;
        if recovery_period.is_zero() {
            return Err(CoreError::Validation(
                "PEERWORK_RECOVERY_PERIOD_SECS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            hostname,
            bind_host,
            peer_port: parse_or(&lookup, "PEERWORK_PEER_PORT", defaults.peer_port)?,
            worker_addr,
            max_load_per_worker,
            processing_timeout: secs_or(
                &lookup,
                "PEERWORK_PROCESSING_TIMEOUT_SECS",
                defaults.processing_timeout,
            )?,
            recovery_period,
            heartbeat_interval: nonzero_secs_or(
                &lookup,
                "PEERWORK_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            )?,
            load_report_interval: nonzero_secs_or(
                &lookup,
                "PEERWORK_LOAD_REPORT_SECS",
                defaults.load_report_interval,
            )?,
            connect_timeout: secs_or(
                &lookup,
                "PEERWORK_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            )?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has an invalid value: {raw}"))),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

/// Intervals fed to `tokio::time::interval`, which rejects zero.
fn nonzero_secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = secs_or(lookup, key, default)?;
    if value.is_zero() {
        return Err(CoreError::Validation(format!("{key} must be at least 1")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<QueueConfig, CoreError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueueConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.peer_port, DEFAULT_PEER_PORT);
        assert_eq!(config.worker_addr.as_deref(), Some(DEFAULT_WORKER_ADDR));
        assert_eq!(config.max_load_per_worker, 5);
        assert_eq!(config.processing_timeout, Duration::from_secs(600));
        assert_eq!(config.recovery_period, Duration::from_secs(60));
    }

    #[test]
    fn hostname_falls_back_to_system_variable() {
        let config = config(&[("HOSTNAME", "cal2.example.com")]).unwrap();
        assert_eq!(config.hostname, "cal2.example.com");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("PEERWORK_HOSTNAME", "cal1.example.com"),
            ("PEERWORK_PEER_PORT", "0"),
            ("PEERWORK_WORKER_ADDR", ""),
            ("PEERWORK_MAX_LOAD_PER_WORKER", "2"),
            ("PEERWORK_PROCESSING_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.hostname, "cal1.example.com");
        assert_eq!(config.peer_port, 0);
        assert_eq!(config.worker_addr, None);
        assert_eq!(config.max_load_per_worker, 2);
        assert_eq!(config.processing_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_number_is_a_validation_error() {
        assert_matches!(
            config(&[("PEERWORK_PEER_PORT", "seventy")]),
            Err(CoreError::Validation(msg)) if msg.contains("PEERWORK_PEER_PORT")
        );
    }

    #[test]
    fn zero_capacity_rejected() {
        assert_matches!(
            config(&[("PEERWORK_MAX_LOAD_PER_WORKER", "0")]),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn invalid_hostname_rejected() {
        assert_matches!(
            config(&[("PEERWORK_HOSTNAME", "bad host")]),
            Err(CoreError::Validation(_))
        );
    }
}
