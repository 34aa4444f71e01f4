//! Reconnect pacing
//!
//! Fixed-delay throttle: every reconnect attempt is preceded by a pause, and
//! consecutive failed attempts are spaced at least `delay` apart.

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::FeedError;
use crate::shutdown::Shutdown;

/// Lower bound on any pause, even when a login attempt outlasted the delay
const MIN_PAUSE: Duration = Duration::from_millis(100);

/// Failure counter and last-attempt timestamp
#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    /// Consecutive failed attempts in the current reconnect episode
    pub failures: u32,
    pub last_attempt: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct ReconnectThrottle {
    delay: Duration,
    state: ThrottleState,
}

impl ReconnectThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: ThrottleState::default(),
        }
    }

    pub fn state(&self) -> &ThrottleState {
        &self.state
    }

    /// Pause required before the next attempt
    pub fn next_wait(&self, now: Instant) -> Duration {
        let floor = MIN_PAUSE.min(self.delay);
        match self.state.last_attempt {
            Some(last) if self.state.failures > 0 => {
                self.delay.saturating_sub(now.saturating_duration_since(last)).max(floor)
            }
            _ => self.delay.max(floor),
        }
    }

    /// Wait out the pause, then stamp the attempt
    pub async fn pace(&mut self, shutdown: &mut Shutdown) -> Result<Duration, FeedError> {
        let wait = self.next_wait(Instant::now());
        debug!(wait_ms = wait.as_millis() as u64, failures = self.state.failures, "Pacing reconnect attempt");
        shutdown.sleep(wait).await?;
        self.state.last_attempt = Some(Instant::now());
        Ok(wait)
    }

    pub fn record_failure(&mut self) {
        self.state.failures += 1;
    }

    pub fn record_success(&mut self) {
        self.state.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_waits_full_delay() {
        let throttle = ReconnectThrottle::new(Duration::from_secs(5));
        assert_eq!(throttle.next_wait(Instant::now()), Duration::from_secs(5));
    }

    #[test]
    fn test_failed_attempts_spaced_by_delay() {
        let mut throttle = ReconnectThrottle::new(Duration::from_secs(5));
        let start = Instant::now();
        throttle.state.last_attempt = Some(start);
        throttle.record_failure();

        let wait = throttle.next_wait(start + Duration::from_secs(2));
        assert_eq!(wait, Duration::from_secs(3));
    }

    #[test]
    fn test_wait_never_zero() {
        let mut throttle = ReconnectThrottle::new(Duration::from_secs(1));
        let start = Instant::now();
        throttle.state.last_attempt = Some(start);
        throttle.record_failure();

        let wait = throttle.next_wait(start + Duration::from_secs(30));
        assert_eq!(wait, MIN_PAUSE);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut throttle = ReconnectThrottle::new(Duration::from_secs(1));
        throttle.record_failure();
        throttle.record_failure();
        assert_eq!(throttle.state().failures, 2);
        throttle.record_success();
        assert_eq!(throttle.state().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_sleeps_and_stamps() {
        let mut throttle = ReconnectThrottle::new(Duration::from_millis(500));
        let mut shutdown = Shutdown::never();
        let before = Instant::now();

        let waited = throttle.pace(&mut shutdown).await.unwrap();

        assert_eq!(waited, Duration::from_millis(500));
        assert!(Instant::now() - before >= Duration::from_millis(500));
        assert!(throttle.state().last_attempt.is_some());
    }
}
