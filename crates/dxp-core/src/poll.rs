//! Bounded readiness polling.
//!
//! Hardware readiness checks (FPGA done flag, DSP BUSY symbol, control task
//! completion) all share one shape: evaluate a predicate, sleep a fixed
//! interval, give up after a fixed number of attempts. [`poll_until`] is that
//! loop; callers convert the resulting [`DxpError::Timeout`] into the more
//! specific timeout variant for their context.

use crate::error::{DxpError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval and attempt budget for a readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Sleep between two evaluations of the predicate
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Maximum number of predicate evaluations
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Create a policy from an explicit attempt count.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Create a policy that polls every `interval` for at most `timeout`,
    /// i.e. `ceil(timeout / interval)` attempts (at least one).
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            (timeout.as_secs_f64() / interval.as_secs_f64()).ceil() as u32
        };
        Self {
            interval,
            max_attempts: attempts.max(1),
        }
    }

    /// Split `timeout` into `divisions` equal polls.
    pub fn divided(timeout: Duration, divisions: u32) -> Self {
        let divisions = divisions.max(1);
        Self {
            interval: timeout / divisions,
            max_attempts: divisions,
        }
    }
}

/// Evaluate `predicate` until it returns `Ok(true)`, sleeping with `sleep`
/// between attempts.
///
/// Returns the number of attempts used. Errors from the predicate abort the
/// poll immediately; exhausting the budget yields [`DxpError::Timeout`]
/// labelled with `what`.
pub fn poll_until<S, P>(
    policy: &PollPolicy,
    what: &str,
    mut sleep: S,
    mut predicate: P,
) -> Result<u32>
where
    S: FnMut(Duration),
    P: FnMut() -> Result<bool>,
{
    for attempt in 1..=policy.max_attempts {
        if predicate()? {
            return Ok(attempt);
        }
        if attempt < policy.max_attempts {
            sleep(policy.interval);
        }
    }
    Err(DxpError::Timeout {
        what: what.to_string(),
        attempts: policy.max_attempts,
    })
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
