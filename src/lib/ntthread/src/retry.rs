//! Bounded retrying of operations that report `STATUS_PENDING`.

use std::time::Duration;

use nt_api::NtResult;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RetryOutcome<T> {
    Ready { value: T, attempts: u32 },
    /// Every attempt was still pending.
    Exhausted { attempts: u32 },
}

/// Runs `op` until it produces a value, fails, or `policy.attempts` runs are
/// used up. `op` returns `Ok(None)` while pending. `sleep` runs between
/// attempts, not after the last one.
pub fn retry_while_pending<T>(
    policy: RetryPolicy,
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut() -> NtResult<Option<T>>,
) -> NtResult<RetryOutcome<T>> {
    for attempt in 1..=policy.attempts {
        if let Some(value) = op()? {
            return Ok(RetryOutcome::Ready {
                value,
                attempts: attempt,
            });
        }
        if attempt < policy.attempts {
            sleep(policy.delay);
        }
    }
    Ok(RetryOutcome::Exhausted {
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod test {
    use nt_api::NtStatus;

    use super::*;

    const POLICY: RetryPolicy = RetryPolicy {
        attempts: 5,
        delay: Duration::from_millis(3),
    };

    #[test]
    fn test_ready_after_pending() {
        let mut sleeps = Vec::new();
        let mut calls = 0;
        let outcome = retry_while_pending(
            POLICY,
            |d| sleeps.push(d),
            || {
                calls += 1;
                Ok((calls == 3).then_some("done"))
            },
        );
        assert_eq!(
            outcome,
            Ok(RetryOutcome::Ready {
                value: "done",
                attempts: 3
            })
        );
        assert_eq!(sleeps, vec![Duration::from_millis(3); 2]);
    }

    #[test]
    fn test_exhausted() {
        let mut sleeps = 0;
        let mut calls = 0;
        let outcome = retry_while_pending(
            POLICY,
            |_| sleeps += 1,
            || {
                calls += 1;
                Ok(None::<()>)
            },
        );
        assert_eq!(outcome, Ok(RetryOutcome::Exhausted { attempts: 5 }));
        assert_eq!(calls, 5);
        assert_eq!(sleeps, 4);
    }

    #[test]
    fn test_error_stops_retrying() {
        let mut calls = 0;
        let outcome = retry_while_pending(
            POLICY,
            |_| {},
            || {
                calls += 1;
                if calls == 2 {
                    Err(NtStatus::INVALID_HANDLE)
                } else {
                    Ok(None::<()>)
                }
            },
        );
        assert_eq!(outcome, Err(NtStatus::INVALID_HANDLE));
        assert_eq!(calls, 2);
    }
}
