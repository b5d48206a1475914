use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::context::OpContext;
use crate::error::{Error, Result};

/// Retry a fallible operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first), at least one is made.
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: The closure to retry.
pub fn retry<F, T, E>(
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    mut f: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> std::result::Result<T, E>,
    E: Display,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bounds for a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Double the interval after each miss, capped at eight times the base.
    pub backoff: bool,
}

impl PollPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: false,
        }
    }

    pub fn exponential(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: true,
        }
    }
}

/// Poll `check` until it yields a value, the attempt budget runs out, the
/// context deadline passes, or the context is cancelled.
///
/// `check` returns `Ok(None)` for "not yet"; an `Err` aborts the poll.
pub fn poll_until<T, F>(ctx: &OpContext, policy: PollPolicy, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let cap = policy.interval * 8;
    let mut delay = policy.interval;

    for attempt in 1..=policy.max_attempts {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled {
                what: what.to_string(),
            });
        }
        if let Some(val) = check()? {
            return Ok(val);
        }
        if attempt == policy.max_attempts {
            break;
        }
        let sleep_for = match ctx.remaining() {
            Some(rem) if rem.is_zero() => {
                return Err(Error::Timeout {
                    what: what.to_string(),
                    attempts: attempt,
                });
            }
            Some(rem) => delay.min(rem),
            None => delay,
        };
        debug!(
            attempt,
            delay_ms = sleep_for.as_millis() as u64,
            "waiting for {}",
            what
        );
        thread::sleep(sleep_for);
        if policy.backoff {
            delay = (delay * 2).min(cap);
        }
    }

    Err(Error::Timeout {
        what: what.to_string(),
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(attempts: u32) -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(1), attempts)
    }

    #[test]
    fn test_retry_succeeds_first_try() {
        let result: std::result::Result<i32, String> =
            retry(3, Duration::from_millis(1), "test", || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let count = Cell::new(0);
        let result = retry(3, Duration::from_millis(1), "test", || {
            let c = count.get() + 1;
            count.set(c);
            if c < 3 {
                return Err("not yet".to_string());
            }
            Ok(c)
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_exhausts_all_attempts() {
        let count = Cell::new(0);
        let result: std::result::Result<i32, String> =
            retry(3, Duration::from_millis(1), "test", || {
                count.set(count.get() + 1);
                Err("always fails".to_string())
            });
        assert!(result.is_err());
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_retry_zero_attempts_still_tries_once() {
        let count = Cell::new(0);
        let _: std::result::Result<(), String> = retry(0, Duration::from_millis(1), "test", || {
            count.set(count.get() + 1);
            Err("fail".to_string())
        });
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_poll_until_ready_on_third_check() {
        let count = Cell::new(0);
        let val = poll_until(&OpContext::background(), fast(5), "thing", || {
            count.set(count.get() + 1);
            Ok((count.get() == 3).then_some("done"))
        })
        .unwrap();
        assert_eq!(val, "done");
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_poll_until_times_out() {
        let count = Cell::new(0);
        let err = poll_until::<(), _>(&OpContext::background(), fast(4), "thing", || {
            count.set(count.get() + 1);
            Ok(None)
        })
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 4, .. }));
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn test_poll_until_propagates_check_error() {
        let err = poll_until::<(), _>(&OpContext::background(), fast(4), "thing", || {
            Err(Error::InvalidSpec("boom".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_poll_until_cancelled() {
        let ctx = OpContext::background();
        ctx.cancel();
        let err = poll_until::<(), _>(&ctx, fast(4), "thing", || Ok(None)).unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[test]
    fn test_poll_until_respects_deadline() {
        let ctx = OpContext::with_timeout(Duration::ZERO);
        let err = poll_until::<(), _>(&ctx, fast(100), "thing", || Ok(None)).unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 1, .. }));
    }
}
