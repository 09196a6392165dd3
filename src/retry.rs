//! Retry-Schedule Calculator (C4): pure arithmetic for the fetch/install
//! backoff schedule and the report-status attempt budget. No I/O, no state;
//! exhaustively tested against the epoch table worked out in spec.md §4.1/§8.

use chrono::Duration as ChronoDuration;
use std::time::Duration;

/// Lowest interval the schedule will ever hand back.
const FLOOR: Duration = Duration::from_secs(60);

/// Attempts sharing the same interval before the schedule advances to the
/// next epoch.
const ATTEMPTS_PER_EPOCH: u32 = 3;

/// Floor on `max_sending_attempts` when the ratio would otherwise be too
/// small to give the server a fair shot at hearing about the deployment.
const MIN_REPORT_SEND_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Wait(Duration),
    Exhausted,
}

/// The interval used by epoch `e` (0-based): `min(2^e minutes, cap)`, where
/// `cap` is `max_interval` floored at one minute.
fn epoch_interval(epoch: u32, cap: Duration) -> Duration {
    let cap = cap.max(FLOOR);
    let doubled = ChronoDuration::minutes(1)
        .checked_mul(1i32.checked_shl(epoch).unwrap_or(i32::MAX))
        .and_then(|d| d.to_std().ok())
        .unwrap_or(cap);
    doubled.min(cap)
}

/// `getFetchInstallRetry(attempt, maxInterval)`: returns the interval to
/// wait before the `attempt`-th retry (1-based: the first retry after the
/// first failure is `attempt == 1`), or `Exhausted` once the cap's epoch has
/// used up its own attempt budget.
pub fn fetch_install_retry(attempt: u32, max_interval: Duration) -> RetryDecision {
    let cap = max_interval.max(FLOOR);

    // Walk epochs until we find the one containing `attempt`, or discover
    // that the cap epoch has already been exhausted.
    let mut epoch = 0u32;
    let mut attempts_used = 0u32;
    loop {
        let interval = epoch_interval(epoch, cap);
        let at_cap = interval >= cap;

        if attempt <= attempts_used + ATTEMPTS_PER_EPOCH {
            return RetryDecision::Wait(interval);
        }
        attempts_used += ATTEMPTS_PER_EPOCH;

        // The capped epoch is the last one: once its own attempt budget is
        // spent the schedule is exhausted rather than repeating the cap
        // forever.
        if at_cap {
            return RetryDecision::Exhausted;
        }
        epoch += 1;
    }
}

/// `maxSendingAttempts(pollInterval, retryInterval)`.
pub fn max_sending_attempts(poll_interval: Duration, retry_interval: Duration) -> u32 {
    if retry_interval.is_zero() {
        return MIN_REPORT_SEND_RETRIES;
    }
    let ratio = (poll_interval.as_secs_f64() / retry_interval.as_secs_f64()) as u32;
    if ratio < MIN_REPORT_SEND_RETRIES {
        MIN_REPORT_SEND_RETRIES
    } else {
        ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_one_minute_exhausts_after_three_attempts() {
        let cap = Duration::from_secs(60);
        for attempt in 1..=3 {
            assert_eq!(
                fetch_install_retry(attempt, cap),
                RetryDecision::Wait(Duration::from_secs(60))
            );
        }
        assert_eq!(fetch_install_retry(4, cap), RetryDecision::Exhausted);
    }

    #[test]
    fn cap_two_minutes_exhausts_after_six_attempts() {
        let cap = Duration::from_secs(120);
        for attempt in 1..=3 {
            assert_eq!(
                fetch_install_retry(attempt, cap),
                RetryDecision::Wait(Duration::from_secs(60))
            );
        }
        for attempt in 4..=6 {
            assert_eq!(
                fetch_install_retry(attempt, cap),
                RetryDecision::Wait(Duration::from_secs(120))
            );
        }
        assert_eq!(fetch_install_retry(7, cap), RetryDecision::Exhausted);
    }

    #[test]
    fn cap_five_minutes_matches_s3_scenario_twelve_attempts() {
        // spec.md §8 S3: UpdatePollInterval=5 min permits 12 retry attempts
        // across epochs 1m,2m,4m,5m (3 each).
        let cap = Duration::from_secs(5 * 60);
        let expected = [
            (1, 60), (2, 60), (3, 60),
            (4, 120), (5, 120), (6, 120),
            (7, 240), (8, 240), (9, 240),
            (10, 300), (11, 300), (12, 300),
        ];
        for (attempt, secs) in expected {
            assert_eq!(
                fetch_install_retry(attempt, cap),
                RetryDecision::Wait(Duration::from_secs(secs)),
                "attempt {attempt}"
            );
        }
        assert_eq!(fetch_install_retry(13, cap), RetryDecision::Exhausted);
    }

    #[test]
    fn cap_ten_minutes_matches_fifteen_attempt_boundary() {
        // spec.md §4.1: cap 10m -> epochs 1m,2m,4m,8m,10m,10m -> 15 boundary.
        let cap = Duration::from_secs(10 * 60);
        let expected = [
            (1, 60), (2, 60), (3, 60),
            (4, 120), (5, 120), (6, 120),
            (7, 240), (8, 240), (9, 240),
            (10, 480), (11, 480), (12, 480),
            (13, 600), (14, 600), (15, 600),
        ];
        for (attempt, secs) in expected {
            assert_eq!(
                fetch_install_retry(attempt, cap),
                RetryDecision::Wait(Duration::from_secs(secs)),
                "attempt {attempt}"
            );
        }
        assert_eq!(fetch_install_retry(16, cap), RetryDecision::Exhausted);
    }

    #[test]
    fn sub_minute_cap_is_floored_at_one_minute() {
        let cap = Duration::from_millis(100);
        assert_eq!(
            fetch_install_retry(1, cap),
            RetryDecision::Wait(Duration::from_secs(60))
        );
        assert_eq!(fetch_install_retry(4, cap), RetryDecision::Exhausted);
    }

    #[test]
    fn max_sending_attempts_s6_scenario() {
        assert_eq!(
            max_sending_attempts(Duration::from_secs(5), Duration::from_secs(1)),
            5
        );
        assert_eq!(
            max_sending_attempts(Duration::from_secs(5), Duration::from_secs(0)),
            3
        );
    }

    #[test]
    fn max_sending_attempts_floors_at_three() {
        assert_eq!(
            max_sending_attempts(Duration::from_secs(2), Duration::from_secs(5)),
            3
        );
    }
}
