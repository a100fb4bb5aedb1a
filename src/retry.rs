use std::time::Duration;

/// Bounds on re-delivery of failed jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total deliveries allowed for one dispatch, including the first.
    pub max_attempts: u32,

    /// Fixed delay before a failed job is delivered again.
    pub backoff: Duration,

    /// Re-enqueue generic handler failures. Off by default: the failure is
    /// recorded on the hit and an operator re-dispatches explicitly.
    pub retry_failed: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            retry_failed: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.retry_failed = true;
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Delay before the next delivery of a job whose `attempt`-th delivery
    /// failed, or `None` when the failure is final.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.retry_failed || attempt >= self.max_attempts {
            return None;
        }
        Some(self.backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        assert_eq!(RetryPolicy::default().next_delay(1), None);
    }

    #[test]
    fn stops_at_max_attempts() {
        let policy = RetryPolicy::default().with_retries(3, Duration::from_secs(10));
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(3), None);
    }
}
