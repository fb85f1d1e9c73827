//! qntx-retry
//!
//! In-memory bounded-retry queue for transient action failures (§4.C7).
//! `Instant`-based like the rate limiter, so tests drive time explicitly
//! rather than sleeping.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use qntx_model::Attestation;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const MAX_ATTEMPTS: u32 = 5;

/// `delay(attempt) = min(INITIAL_BACKOFF * 2^(attempt-1), MAX_BACKOFF)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let scaled = INITIAL_BACKOFF.checked_mul(1u32 << shift).unwrap_or(MAX_BACKOFF);
    scaled.min(MAX_BACKOFF)
}

/// A retry slot: a deep-copied attestation snapshot awaiting re-dispatch.
#[derive(Debug, Clone)]
pub struct PendingExecution {
    pub watcher_id: String,
    pub attestation: Attestation,
    pub attempt: u32,
    pub next_retry_at: Instant,
    pub last_error: String,
}

pub struct RetryQueue {
    items: Mutex<Vec<PendingExecution>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a first-attempt retry after an initial dispatch failure.
    /// Always succeeds: attempt 1 never exceeds `MAX_ATTEMPTS`.
    pub fn enqueue_first_failure(
        &self,
        watcher_id: impl Into<String>,
        attestation: Attestation,
        last_error: impl Into<String>,
        now: Instant,
    ) {
        let item = PendingExecution {
            watcher_id: watcher_id.into(),
            attestation: attestation.deep_clone(),
            attempt: 1,
            next_retry_at: now + backoff_delay(1),
            last_error: last_error.into(),
        };
        self.items.lock().unwrap().push(item);
    }

    /// After a retried dispatch at `item.attempt` fails again, either
    /// re-enqueue at `attempt + 1` or, if that would exceed `MAX_ATTEMPTS`,
    /// drop it and return `None` for the caller to log at `warn!`.
    pub fn requeue_after_failure(
        &self,
        item: PendingExecution,
        last_error: impl Into<String>,
        now: Instant,
    ) -> Option<()> {
        let next_attempt = item.attempt + 1;
        if next_attempt > MAX_ATTEMPTS {
            return None;
        }
        let requeued = PendingExecution {
            watcher_id: item.watcher_id,
            attestation: item.attestation,
            attempt: next_attempt,
            next_retry_at: now + backoff_delay(next_attempt),
            last_error: last_error.into(),
        };
        self.items.lock().unwrap().push(requeued);
        Some(())
    }

    /// Atomically partition the queue into due (`next_retry_at <= now`) and
    /// remaining, returning the due items. The lock is held only for the
    /// partition itself; dispatching due items happens after release.
    pub fn partition_due(&self, now: Instant) -> Vec<PendingExecution> {
        let mut guard = self.items.lock().unwrap();
        let (due, remaining): (Vec<_>, Vec<_>) =
            guard.drain(..).partition(|item| item.next_retry_at <= now);
        *guard = remaining;
        due
    }

    /// Drop every pending execution belonging to a watcher that has since
    /// been deleted or disabled (§4.C7: "silently discarded").
    pub fn discard_for_watcher(&self, watcher_id: &str) {
        self.items.lock().unwrap().retain(|item| item.watcher_id != watcher_id);
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn attestation() -> Attestation {
        Attestation::new(
            "a1",
            chrono::Utc::now(),
            "test",
            vec![],
            vec![],
            vec![],
            vec![],
            BTreeMap::new(),
        )
    }

    #[test]
    fn backoff_doubles_until_capped_at_max() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn due_partition_leaves_not_yet_due_items_in_queue() {
        let queue = RetryQueue::new();
        let t0 = Instant::now();
        queue.enqueue_first_failure("w1", attestation(), "err", t0);

        let due = queue.partition_due(t0);
        assert!(due.is_empty());
        assert_eq!(queue.len(), 1);

        let due = queue.partition_due(t0 + Duration::from_secs(2));
        assert_eq!(due.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn discard_for_watcher_removes_only_matching_entries() {
        let queue = RetryQueue::new();
        let t0 = Instant::now();
        queue.enqueue_first_failure("w1", attestation(), "err", t0);
        queue.enqueue_first_failure("w2", attestation(), "err", t0);

        queue.discard_for_watcher("w1");
        assert_eq!(queue.len(), 1);

        let due = queue.partition_due(t0 + Duration::from_secs(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].watcher_id, "w2");
    }
}
