//! Exponential backoff used by the reader loop, publisher and lanes
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound of a single delay
    pub max: Duration,
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl Backoff {
    pub fn bounded(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
            ..Default::default()
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        if self.max < initial {
            self.max = initial;
        }
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max.as_millis() as f64) as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let b = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
            max_attempts: None,
        };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(800));
        assert_eq!(b.delay(5), Duration::from_millis(1000));
        assert_eq!(b.delay(100), Duration::from_millis(1000));
    }

    #[test]
    fn test_bounded_attempts() {
        let b = Backoff::bounded(3);
        assert!(b.should_retry(1));
        assert!(b.should_retry(2));
        assert!(!b.should_retry(3));
        assert!(Backoff::unbounded().should_retry(u32::MAX));
    }
}
