use ahash::AHashMap;
use std::{hash::Hash, time::Duration};

/// Decides how long a failing item waits before it is retried
pub trait RateLimiter<T>: Send {
    /// The delay before the next retry of `item`, recording one more failure for it
    fn when(&mut self, item: &T) -> Duration;

    /// Stop tracking `item`, so its next failure starts from the base delay again
    fn forget(&mut self, item: &T);

    /// How many failures have been recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: AHashMap<T, u32>,
}

impl<T> ExponentialRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: AHashMap::new(),
        }
    }
}

impl<T> Default for ExponentialRateLimiter<T> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<T> RateLimiter<T> for ExponentialRateLimiter<T>
where
    T: Eq + Hash + Clone + Send,
{
    fn when(&mut self, item: &T) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);
        self.base.saturating_mul(2_u32.saturating_pow(exp)).min(self.max)
    }

    fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::{ExponentialRateLimiter, RateLimiter};
    use std::time::Duration;

    #[test]
    fn delay_doubles_per_failure_up_to_the_ceiling() {
        let mut limiter = ExponentialRateLimiter::new(Duration::from_millis(100), Duration::from_secs(1));
        let delays: Vec<_> = (0..6).map(|_| limiter.when(&"a")).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000].map(Duration::from_millis));
        assert_eq!(limiter.num_requeues(&"a"), 6);
        assert_eq!(limiter.when(&"b"), Duration::from_millis(100));
    }

    #[test]
    fn forget_resets_to_base() {
        let mut limiter = ExponentialRateLimiter::new(Duration::from_millis(100), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(100));
    }

    #[test]
    fn huge_failure_counts_saturate() {
        let mut limiter = ExponentialRateLimiter::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.when(&()) <= Duration::from_secs(60));
        }
    }
}
