//! Exponential backoff for re-establishing a worker's link to its node.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second connection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Next backoff delay, clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Call `connect` until it succeeds, sleeping with exponential backoff
/// between failures.
///
/// Returns `None` if `cancel` fires first.
pub async fn connect_with_backoff<T, E, F, Fut>(
    target: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
    mut connect: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = connect() => match result {
                Ok(conn) => {
                    tracing::info!(%target, attempt, "Connected");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::warn!(
                        %target,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Connection attempt {attempt} failed",
                    );
                }
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
