//! Capped exponential backoff, shared by the engine restart loop and the reconciler.

use std::time::Duration;

use rand::RngCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Adds up to `delay / jitter_divisor` of random delay; 0 disables jitter.
    pub jitter_divisor: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter_divisor: 4,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_divisor = 0;
        self
    }

    /// `base * 2^attempt`, saturating at `cap`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 0..attempt {
            match delay.checked_mul(2) {
                Some(next) if next < self.cap => delay = next,
                _ => return self.cap,
            }
        }
        delay.min(self.cap)
    }
}

#[derive(Debug)]
pub struct Backoff<R> {
    policy: BackoffPolicy,
    attempt: u32,
    rng: R,
}

impl<R: RngCore> Backoff<R> {
    pub fn new(policy: BackoffPolicy, rng: R) -> Self {
        Self {
            policy,
            attempt: 0,
            rng,
        }
    }

    /// Consecutive delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_max_ms = match self.policy.jitter_divisor {
            0 => 0,
            divisor => base_ms / u64::from(divisor),
        };
        let jitter_ms = if jitter_max_ms == 0 {
            0
        } else {
            self.rng.next_u64() % (jitter_max_ms + 1)
        };

        Duration::from_millis(base_ms.saturating_add(jitter_ms)).min(self.policy.cap)
    }
}
