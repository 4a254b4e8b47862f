use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::jobs::error::{JobsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Per-job retry settings. Every field is optional in the stored JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff: Backoff,
    pub initial_delay_seconds: i64,
    pub max_delay_seconds: i64,
    /// Fraction of the delay applied as +/- random jitter, 0.0 disables it.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            initial_delay_seconds: 10,
            max_delay_seconds: 5 * 60,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Decode a stored policy. Absent or `null` means the defaults.
    pub fn from_value(value: Option<&serde_json::Value>) -> Result<Self> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(v) => {
                let policy: Self = serde_json::from_value(v.clone())
                    .map_err(|e| JobsError::validation(format!("retry_policy: {e}")))?;
                policy.validate()?;
                Ok(policy)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(JobsError::validation("retry_policy.max_attempts must be >= 1"));
        }
        if self.initial_delay_seconds < 0 || self.max_delay_seconds < 0 {
            return Err(JobsError::validation("retry_policy delays must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(JobsError::validation("retry_policy.jitter must be within 0..=1"));
        }
        Ok(())
    }

    /// Whether a run that just finished `attempt` should be retried.
    pub fn should_retry(&self, attempt: i32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt that follows `attempt`, without jitter.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1) as u32;
        let initial = self.initial_delay_seconds.max(0);
        let max = self.max_delay_seconds.max(0);

        let secs = match self.backoff {
            Backoff::Fixed => initial,
            Backoff::Linear => initial.saturating_mul(i64::from(attempt)),
            Backoff::Exponential => {
                // 2^(attempt-1); past 62 shifts the multiplier saturates and the cap applies.
                let pow2 = 1_i64.checked_shl(attempt - 1).filter(|p| *p > 0).unwrap_or(i64::MAX);
                initial.saturating_mul(pow2)
            }
        };

        Duration::from_secs(secs.min(max) as u64)
    }

    /// [`delay_for`](Self::delay_for) with jitter applied, clamped to `[0, max_delay]`.
    pub fn jittered_delay_for(&self, attempt: i32, rng: &mut impl Rng) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let range = base_secs * self.jitter;
        let offset = if range > 0.0 {
            rng.gen_range(-range..=range)
        } else {
            0.0
        };
        let max = self.max_delay_seconds.max(0) as f64;
        Duration::from_secs_f64((base_secs + offset).clamp(0.0, max))
    }
}
