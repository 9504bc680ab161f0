//! Bounded busy-wait polling
//!
//! Every wait on hardware goes through [`poll`], so the policy of each loop
//! is visible at the call site: resident flash waits spin forever and rely on
//! the watchdog, debug-port waits give up after a fixed number of attempts.

use thiserror::Error;

/// How long a poll may spin
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Bound {
    /// Spin until ready, recovery is left to the watchdog
    Forever,
    /// Check at most this many times
    Attempts(u32),
}

#[derive(Copy, Clone, PartialEq, Debug, Error)]
#[error("condition not met after {attempts} attempts")]
pub struct Timeout {
    pub attempts: u32,
}

/// Call `ready` until it returns true or the bound is exhausted.
///
/// Returns the number of calls made. With `Bound::Attempts(n)` the predicate
/// is called at most `n` times.
pub fn poll<F>(bound: Bound, mut ready: F) -> Result<u32, Timeout>
where
    F: FnMut() -> bool,
{
    let mut attempts: u32 = 0;

    loop {
        if let Bound::Attempts(max) = bound {
            if attempts >= max {
                return Err(Timeout { attempts });
            }
        }

        attempts = attempts.saturating_add(1);
        if ready() {
            return Ok(attempts);
        }
    }
}

/// Fallible variant of [`poll`] for predicates that touch a transport.
///
/// Predicate errors end the poll immediately and are returned as `Err(Err(e))`.
pub fn try_poll<F, E>(bound: Bound, mut ready: F) -> Result<u32, Result<Timeout, E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let mut failure = None;

    let res = poll(bound, || match ready() {
        Ok(v) => v,
        Err(e) => {
            failure = Some(e);
            true
        }
    });

    match (res, failure) {
        (_, Some(e)) => Err(Err(e)),
        (Ok(n), None) => Ok(n),
        (Err(t), None) => Err(Ok(t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_poll_calls_exactly_max() {
        let mut calls = 0;
        let res = poll(Bound::Attempts(100), || {
            calls += 1;
            false
        });
        assert_eq!(res, Err(Timeout { attempts: 100 }));
        assert_eq!(calls, 100);
    }

    #[test]
    fn ready_on_last_attempt() {
        let mut calls = 0;
        let res = poll(Bound::Attempts(3), || {
            calls += 1;
            calls == 3
        });
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn zero_attempts_never_calls() {
        let res = poll(Bound::Attempts(0), || panic!("called"));
        assert_eq!(res, Err(Timeout { attempts: 0 }));
    }

    #[test]
    fn forever_waits() {
        let mut calls = 0;
        let res = poll(Bound::Forever, || {
            calls += 1;
            calls == 5000
        });
        assert_eq!(res, Ok(5000));
    }

    #[test]
    fn try_poll_stops_on_error() {
        let mut calls = 0;
        let res: Result<u32, Result<Timeout, &str>> = try_poll(Bound::Attempts(10), || {
            calls += 1;
            if calls == 2 {
                Err("broken")
            } else {
                Ok(false)
            }
        });
        assert_eq!(res, Err(Err("broken")));
        assert_eq!(calls, 2);

        let res: Result<u32, Result<Timeout, &str>> = try_poll(Bound::Attempts(4), || Ok(false));
        assert_eq!(res, Err(Ok(Timeout { attempts: 4 })));
    }
}
