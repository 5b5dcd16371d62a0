//! Retry wrapper for transient I/O failures.
//!
//! Collaborator calls that may fail transiently (opening an input, reading
//! or writing a tile) are funneled through [`with_retry`]. Permanent errors
//! and exhausted policies propagate to the caller, which tags them with the
//! tile identity and aborts the batch.

use tracing::warn;

use super::SourceError;
use crate::executor::RetryPolicy;

/// Runs `op`, retrying transient failures according to `policy`.
///
/// The total number of invocations never exceeds `policy.max_attempts()`.
/// Non-transient errors are returned immediately without retrying.
pub fn with_retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Result<T, SourceError>,
{
    let mut attempt = 1u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => match policy.delay_for_attempt(attempt) {
                Some(delay) => {
                    warn!(
                        what,
                        attempt,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn flaky(fail_times: u32, calls: &AtomicU32) -> impl FnMut() -> Result<u32, SourceError> + '_ {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= fail_times {
                Err(SourceError::Unavailable(format!("failure {call}")))
            } else {
                Ok(call)
            }
        }
    }

    #[test]
    fn test_succeeds_without_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = with_retry(&policy, "test", flaky(0, &calls)).unwrap();
        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fails_twice_then_succeeds_in_three_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = with_retry(&policy, "test", flaky(2, &calls)).unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_always_failing_stops_after_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = with_retry(&policy, "test", flaky(99, &calls));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let result: Result<(), _> = with_retry(&policy, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::InvalidData("corrupt".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_retry_policy_single_attempt() {
        let calls = AtomicU32::new(0);

        let result = with_retry(&RetryPolicy::None, "test", flaky(1, &calls));
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
