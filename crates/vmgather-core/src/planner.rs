//! Pure function splitting a time range into batch windows.

use chrono::Duration;

use crate::model::{
    BatchSettings, BatchStrategy, BatchWindow, TimeRange, MAX_BATCH_INTERVAL_SECS,
    MIN_BATCH_INTERVAL_SECS,
};

/// Selects the auto interval (seconds) for a range of the given duration,
/// `<=15 min -> 30s`, `<=6h -> 60s`, otherwise `300s`.
fn auto_interval_seconds(duration: Duration) -> u64 {
    if duration <= Duration::minutes(15) {
        30
    } else if duration <= Duration::hours(6) {
        60
    } else {
        300
    }
}

fn clamp_interval(seconds: u64) -> u64 {
    seconds.clamp(MIN_BATCH_INTERVAL_SECS, MAX_BATCH_INTERVAL_SECS)
}

/// Splits `range` into contiguous, disjoint, half-open windows according to
/// `settings`. Always returns at least one window. The planner is pure and
/// total: it never fails.
pub fn plan(range: TimeRange, settings: BatchSettings) -> Vec<BatchWindow> {
    if !settings.enabled || range.is_empty() {
        return vec![BatchWindow {
            index: 0,
            start: range.start,
            end: range.end,
        }];
    }

    let interval_secs = match settings.strategy {
        BatchStrategy::Auto => auto_interval_seconds(range.duration()),
        BatchStrategy::Custom => clamp_interval(settings.custom_interval_seconds),
    };
    let interval = Duration::seconds(interval_secs as i64);

    let mut windows = Vec::new();
    let mut cursor = range.start;
    let mut index = 0usize;
    while cursor < range.end {
        let next = std::cmp::min(cursor + interval, range.end);
        windows.push(BatchWindow {
            index,
            start: cursor,
            end: next,
        });
        cursor = next;
        index += 1;
    }
    windows
}
