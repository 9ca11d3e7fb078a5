use peerwork_core::error::CoreError;

/// Default port of the HTTP status endpoint.
pub const DEFAULT_STATUS_PORT: u16 = 7680;

/// Status server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `7680`).
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_STATUS_PORT,
        }
    }
}

impl StatusConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var       | Default   |
    /// |---------------|-----------|
    /// | `STATUS_HOST` | `0.0.0.0` |
    /// | `STATUS_PORT` | `7680`    |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let host = lookup("STATUS_HOST").unwrap_or(defaults.host);
        let port = match lookup("STATUS_PORT") {
            None => defaults.port,
            Some(raw) => raw.trim().parse().map_err(|_| {
                CoreError::Validation(format!("STATUS_PORT has an invalid value: {raw}"))
            })?,
        };
        Ok(Self { host, port })
    }
}
