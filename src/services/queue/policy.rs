//! Retry and retention rules shared by every queue backend.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::constants::queue as defaults;

/// Per-entry retry budget with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_ATTEMPTS,
            base_delay: defaults::RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempt`-th failure (1-based): `base * 2^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Delay before the next try, or `None` once the budget is spent.
    pub fn next_delay(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            None
        } else {
            Some(self.delay_for(failed_attempt))
        }
    }
}

/// Bounds on how many finished entries are kept, and for how long.
///
/// An entry is evicted as soon as either bound is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age: Duration,
}

impl RetentionPolicy {
    pub fn completed() -> Self {
        Self {
            max_count: defaults::COMPLETED_KEEP_COUNT,
            max_age: defaults::COMPLETED_KEEP_AGE,
        }
    }

    pub fn failed() -> Self {
        Self {
            max_count: defaults::FAILED_KEEP_COUNT,
            max_age: defaults::FAILED_KEEP_AGE,
        }
    }

    /// Oldest finish time still retained at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let age = chrono::Duration::from_std(self.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Trim `finished` (oldest at the front) and return the evicted ids.
    pub fn evict(
        &self,
        finished: &mut VecDeque<(String, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let cutoff = self.cutoff(now);
        let mut evicted = Vec::new();

        while let Some((_, finished_at)) = finished.front() {
            if finished.len() > self.max_count || *finished_at < cutoff {
                if let Some((id, _)) = finished.pop_front() {
                    evicted.push(id);
                }
            } else {
                break;
            }
        }

        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (1..=3).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![2000, 4000, 8000]);
    }

    #[test]
    fn default_budget_is_three_tries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(4000)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn four_tries_sees_the_full_schedule() {
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };
        let observed: Vec<Option<u128>> = (1..=4)
            .map(|n| policy.next_delay(n).map(|d| d.as_millis()))
            .collect();
        assert_eq!(observed, vec![Some(2000), Some(4000), Some(8000), None]);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(u32::MAX) >= policy.delay_for(20));
    }

    #[test]
    fn evicts_beyond_count() {
        let policy = RetentionPolicy {
            max_count: 2,
            max_age: Duration::from_secs(3600),
        };
        let now = Utc::now();
        let mut finished: VecDeque<_> = ["a", "b", "c"]
            .iter()
            .map(|id| (id.to_string(), now))
            .collect();

        assert_eq!(policy.evict(&mut finished, now), vec!["a".to_string()]);
        assert_eq!(finished.len(), 2);
    }

    #[test]
    fn evicts_beyond_age_even_under_count() {
        let policy = RetentionPolicy::completed();
        let now = Utc::now();
        let mut finished = VecDeque::from(vec![
            ("old".to_string(), now - chrono::Duration::hours(25)),
            ("fresh".to_string(), now - chrono::Duration::hours(1)),
        ]);

        assert_eq!(policy.evict(&mut finished, now), vec!["old".to_string()]);
        assert_eq!(finished.front().map(|(id, _)| id.as_str()), Some("fresh"));
    }

    #[test]
    fn failed_entries_live_for_a_week() {
        let policy = RetentionPolicy::failed();
        let now = Utc::now();
        let mut finished = VecDeque::from(vec![(
            "six-days".to_string(),
            now - chrono::Duration::days(6),
        )]);
        assert!(policy.evict(&mut finished, now).is_empty());
    }
}
