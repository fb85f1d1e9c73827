//! Scenario: five retries then drop
//!
//! # Invariant under test
//! A pending execution is retried up to `MAX_ATTEMPTS` times; once attempt 6
//! would be required it is dropped instead of requeued, and the queue ends
//! up empty.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use qntx_model::Attestation;
use qntx_retry::RetryQueue;

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
fn five_retries_then_drop() {
    let queue = RetryQueue::new();
    let t0 = Instant::now();
    queue.enqueue_first_failure("w1", attestation(), "503", t0);

    let mut now = t0;
    let mut dispatch_count = 0;
    loop {
        now += Duration::from_secs(60);
        let due = queue.partition_due(now);
        if due.is_empty() {
            break;
        }
        for item in due {
            dispatch_count += 1;
            queue.requeue_after_failure(item, "503", now);
        }
    }

    assert_eq!(dispatch_count, 5);
    assert!(queue.is_empty());
}
