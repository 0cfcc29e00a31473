use std::time::Duration;

use proptest::prelude::*;

use gover::database::models::{
    IntegrationQueueSettingDbModel, MAX_MAX_ATTEMPTS, MAX_PRIORITY, MIN_MAX_ATTEMPTS,
    MIN_PRIORITY, NewIntegrationTask, TaskType,
};
use gover::integration::queue_config::rate_gap;
use gover::integration::retry_backoff;

proptest! {
    #[test]
    fn new_task_fields_stay_in_range(priority in any::<i64>(), max_attempts in any::<i64>()) {
        let task = NewIntegrationTask::new(TaskType::Webhook, "{}")
            .with_priority(priority)
            .with_max_attempts(max_attempts);
        prop_assert!((MIN_PRIORITY..=MAX_PRIORITY).contains(&task.effective_priority()));
        prop_assert!((MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&task.effective_max_attempts()));
    }

    #[test]
    fn backoff_is_bounded_and_monotonic(attempt in -10i64..100) {
        let delay = retry_backoff(attempt);
        prop_assert!(delay >= Duration::from_secs(1));
        prop_assert!(delay <= Duration::from_secs(64));
        prop_assert!(retry_backoff(attempt + 1) >= delay);
    }

    #[test]
    fn rate_gap_never_exceeds_a_minute(gap_ms in any::<i64>()) {
        let setting = IntegrationQueueSettingDbModel {
            webhook_rate_gap_ms: gap_ms,
            ..Default::default()
        };
        prop_assert!(rate_gap(&setting, TaskType::Webhook) <= Duration::from_secs(60));
    }
}

#[test]
fn backoff_doubles_until_cap() {
    let delays: Vec<u64> = (1..=8).map(|n| retry_backoff(n).as_secs()).collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 64, 64]);
}
