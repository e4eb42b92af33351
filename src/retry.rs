use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};

use crate::reading::{ErrorKind, QueuedReading, ReadingStatus};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(
                self.base_delay
                    .saturating_mul(2u32.saturating_pow(self.max_retries)),
            )
            .with_factor(2.0)
            .with_max_times(self.max_retries as usize)
    }

    /// Delay before the automatic retry that follows the `retry_count`-th failure.
    ///
    /// `None` once the cap is reached.
    pub fn delay_after(&self, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 {
            return None;
        }
        self.backoff().build().nth(retry_count as usize - 1)
    }

    /// Whether the item may be re-queued without user action at all.
    pub fn is_auto_retryable(&self, item: &QueuedReading) -> bool {
        item.status == ReadingStatus::Failed
            && item.error_kind != Some(ErrorKind::Permanent)
            && self.delay_after(item.retry_count).is_some()
    }

    /// When the automatic retry of `item` becomes due, if it ever does.
    pub fn retry_at(&self, item: &QueuedReading) -> Option<DateTime<Utc>> {
        if !self.is_auto_retryable(item) {
            return None;
        }
        let delay = self.delay_after(item.retry_count)?;
        let last_attempt = item.last_attempt_at.unwrap_or(item.created_at);
        let delay = chrono::Duration::from_std(delay).ok()?;
        last_attempt.checked_add_signed(delay)
    }

    /// Short status text shown next to a queued reading.
    pub fn label(&self, item: &QueuedReading) -> String {
        match item.status {
            ReadingStatus::Pending => "Pending".to_string(),
            ReadingStatus::Uploading => "Uploading".to_string(),
            ReadingStatus::Completed => "Completed".to_string(),
            ReadingStatus::Failed => {
                format!("Failed (Retry {}/{})", item.retry_count, self.max_retries)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_DELAY)
    }
}
