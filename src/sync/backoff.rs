//! Retry scheduling after a fetch attempt

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::fetcher::FetchErrorKind;

/// How far to push `next_run_at` after a failed attempt
///
/// Transient failures back off exponentially up to `max_delay`. Fatal
/// failures always wait `fatal_delay`, however many times they repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first transient failure (doubles each consecutive failure)
    pub base_delay: Duration,
    /// Ceiling for transient delays
    pub max_delay: Duration,
    /// Fixed delay after a fatal failure
    pub fatal_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            fatal_delay: Duration::from_secs(6 * 3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the `failures`-th consecutive transient failure (1-based)
    ///
    /// `min(base_delay * 2^(failures - 1), max_delay)`, without jitter so the
    /// sequence is non-decreasing.
    #[must_use]
    pub fn transient_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Delay before retrying after an error of `kind`
    ///
    /// Rejected packs (unsupported schema, invalid body) are not retried
    /// faster than the normal poll interval.
    #[must_use]
    pub fn delay_for(&self, kind: FetchErrorKind, failures: u32, poll_interval: Duration) -> Duration {
        match kind {
            FetchErrorKind::Transient => self.transient_delay(failures),
            FetchErrorKind::Fatal => self.fatal_delay,
            FetchErrorKind::SchemaUnsupported | FetchErrorKind::Invalid => poll_interval,
        }
    }
}

/// `now + delay`, saturating at a far-future bound
#[must_use]
pub fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
