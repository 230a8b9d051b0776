use std::time::Duration;

/// Exponential reconnect backoff with a ceiling and a bounded attempt count.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self {
            initial: initial.min(ceiling),
            ceiling,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.max_attempts > 0 && self.attempts >= self.max_attempts
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    /// A `max_attempts` of zero retries forever.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let shift = self.attempts.min(16);
        self.attempts += 1;
        Some(self.initial.saturating_mul(1 << shift).min(self.ceiling))
    }

    /// Delay the next call to `next_delay` would return, without consuming it.
    pub fn peek_delay(&self) -> Duration {
        let shift = self.attempts.min(16);
        self.initial.saturating_mul(1 << shift).min(self.ceiling)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5), 6);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 5000, 5000]);
        assert!(backoff.exhausted());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_zero_attempts_means_forever() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 0);
        for _ in 0..100 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.peek_delay(), Duration::from_millis(40));
    }
}
