use std::time::Duration;

/// Fixed-delay retry schedule.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
    skip_first_delay: bool,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            skip_first_delay: false,
        }
    }

    pub fn with_skip_first_delay(mut self, skip: bool) -> Self {
        self.skip_first_delay = skip;
        self
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }
}

/// Per-run attempt counter for a [`RetryPolicy`].
///
/// `next_delay` returns the pause to take before the next attempt, or `None`
/// once the schedule is exhausted. The first attempt is always free; with
/// `skip_first_delay` the first retry is immediate as well.
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        if self.policy.skip_first_delay && self.attempts == 1 {
            return Some(Duration::ZERO);
        }
        Some(self.policy.delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
