//! Timing rules for the lost-work recovery loop and delayed work.
//!
//! All functions take `now` explicitly so they stay deterministic under test.

use std::time::Duration;

use crate::types::Timestamp;

/// Default age past `not_before` after which a still-present row is
/// considered orphaned.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default base period of the recovery loop. Each node scans once per period.
pub const DEFAULT_RECOVERY_PERIOD: Duration = Duration::from_secs(60);

/// Default interval between NodeInfo heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between `ReportLoad` broadcasts to peers.
pub const DEFAULT_LOAD_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound applied to timeouts too large for a chrono duration.
const MAX_TIMEOUT_DAYS: i64 = 365 * 100;

/// Rows whose `not_before` is strictly earlier than this are overdue.
pub fn overdue_cutoff(now: Timestamp, processing_timeout: Duration) -> Timestamp {
    let timeout = chrono::Duration::from_std(processing_timeout)
        .unwrap_or_else(|_| chrono::Duration::days(MAX_TIMEOUT_DAYS));
    now.checked_sub_signed(timeout)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

/// How long to wait before dispatching work that may not run before `not_before`.
///
/// Returns zero when the item is already eligible.
pub fn delay_until(now: Timestamp, not_before: Timestamp) -> Duration {
    (not_before - now).to_std().unwrap_or(Duration::ZERO)
}

/// Delay until this node's next recovery slot.
///
/// The base `period` is divided into `node_count` equal slots and the node
/// at `node_index` (its position among registered nodes sorted by
/// `(hostname, port)`) scans at the start of its slot, so nodes stagger
/// instead of scanning together. A node exactly on its slot waits a full
/// period. A zero `node_count` is treated as a single node and an
/// out-of-range index is clamped to the last slot.
pub fn next_recovery_delay(
    now: Timestamp,
    period: Duration,
    node_count: usize,
    node_index: usize,
) -> Duration {
    let period_ms = (period.as_millis() as i64).max(1);
    let count = node_count.max(1) as i64;
    let index = (node_index as i64).min(count - 1);

    let offset = period_ms * index / count;
    let position = now.timestamp_millis().rem_euclid(period_ms);
    let delay = (offset - position).rem_euclid(period_ms);

    let delay = if delay == 0 { period_ms } else { delay };
    Duration::from_millis(delay as u64)
}
