use std::time::Duration;

use tokio::time::Instant;

use super::ResettableBackoff;

/// Starts the wrapped policy over once no delay was requested for `quiet_period`
///
/// Explicit [`reset`](ResettableBackoff::reset)s are ignored, so a watch that reconnects and
/// fails again right away keeps escalating. Only a long enough healthy stretch lowers the delay.
#[derive(Debug, Clone)]
pub struct ResetTimerBackoff<B> {
    backoff: B,
    last_delay_at: Option<Instant>,
    quiet_period: Duration,
}

impl<B: ResettableBackoff> ResetTimerBackoff<B> {
    pub fn new(backoff: B, quiet_period: Duration) -> Self {
        Self {
            backoff,
            last_delay_at: None,
            quiet_period,
        }
    }
}

impl<B: ResettableBackoff> Iterator for ResetTimerBackoff<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let quiet = self
            .last_delay_at
            .is_some_and(|last| now.saturating_duration_since(last) > self.quiet_period);
        if quiet {
            tracing::debug!(quiet_period = ?self.quiet_period, "no failures for a while, starting the backoff over");
            self.backoff.reset();
        }
        self.last_delay_at = Some(now);
        self.backoff.next()
    }
}

impl<B: ResettableBackoff> ResettableBackoff for ResetTimerBackoff<B> {
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::ResetTimerBackoff;
    use crate::utils::{stream_backoff::tests::StepBackoff, ResettableBackoff};
    use std::time::Duration;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn only_a_quiet_period_starts_over() {
        let mut backoff = ResetTimerBackoff::new(StepBackoff::new(Duration::from_secs(2)), Duration::from_secs(60));
        assert_eq!(backoff.next(), Some(Duration::from_secs(2)));
        advance(Duration::from_secs(40)).await;
        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_secs(4)));
        advance(Duration::from_secs(40)).await;
        assert_eq!(backoff.next(), Some(Duration::from_secs(6)));
        advance(Duration::from_secs(61)).await;
        assert_eq!(backoff.next(), Some(Duration::from_secs(2)));
    }
}
