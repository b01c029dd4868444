use crate::config::Config;
use crate::store::WebhookStore;
use tokio::time::{Duration, sleep};
use tracing::{error, info};

/// Backoff policy for failed handlers. The delays are a fixed schedule
/// clamped to the last entry; both the schedule and the attempt cap are
/// operator-configurable, not invariants.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delays_seconds: Vec<i64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays_seconds: Vec<i64>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays_seconds,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_attempts, config.retry_schedule_seconds.clone())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry following failure number `attempt_index + 1`.
    pub fn delay_seconds(&self, attempt_index: u32) -> i64 {
        let index = (attempt_index as usize).min(self.delays_seconds.len().saturating_sub(1));
        self.delays_seconds.get(index).copied().unwrap_or(0)
    }

    pub fn next_visible_at(&self, now_epoch: i64, attempt_index: u32) -> i64 {
        now_epoch + self.delay_seconds(attempt_index)
    }
}

/// Periodic retention sweep: drops dead-letter entries past the window and
/// prunes COMPLETED rows so the claim scan stays bounded.
pub async fn run_retention_sweeper(store: WebhookStore, retention_seconds: i64, interval: Duration) {
    loop {
        sleep(interval).await;

        let cutoff = crate::dispatcher::epoch_seconds() - retention_seconds;
        match store.purge_dlq_older_than(cutoff) {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged expired dead-letter entries"),
            Err(err) => error!(error = %err, "dead-letter retention sweep failed"),
        }
        match store.purge_completed_older_than(cutoff) {
            Ok(0) => {}
            Ok(purged) => info!(purged, "purged completed webhook records"),
            Err(err) => error!(error = %err, "completed-record retention sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_schedule_then_clamps_to_last_delay() {
        let policy = RetryPolicy::new(3, vec![5, 30, 300]);

        assert_eq!(policy.delay_seconds(0), 5);
        assert_eq!(policy.delay_seconds(1), 30);
        assert_eq!(policy.delay_seconds(2), 300);
        assert_eq!(policy.delay_seconds(7), 300);
    }

    #[test]
    fn next_visible_at_offsets_from_now() {
        let policy = RetryPolicy::new(3, vec![5, 30, 300]);

        assert_eq!(policy.next_visible_at(1_700_000_000, 0), 1_700_000_005);
        assert_eq!(policy.next_visible_at(1_700_000_000, 1), 1_700_000_030);
    }

    #[test]
    fn attempt_cap_has_a_floor_of_one() {
        let policy = RetryPolicy::new(0, vec![5]);
        assert_eq!(policy.max_attempts(), 1);
    }
}
