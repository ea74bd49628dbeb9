use std::time::Duration;

use tokio::time::Instant;

/// Inactivity deadline. Any user interaction touches it; if it elapses while
/// sharing is active the session performs the automatic stop transition.
#[derive(Debug)]
pub struct InactivityWatchdog {
    timeout: Duration,
    deadline: Instant,
}

impl InactivityWatchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Reset the deadline to `now + timeout`.
    pub fn touch(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    /// Resolves when the deadline passes. Touching after this future is
    /// created requires re-creating it, which the session's select loop does
    /// on every iteration.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_timeout() {
        let watchdog = InactivityWatchdog::new(Duration::from_secs(120));
        let started = Instant::now();
        watchdog.expired().await;
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_before_deadline() {
        let watchdog = InactivityWatchdog::new(Duration::from_secs(120));
        let mut expired = tokio_test::task::spawn(watchdog.expired());
        assert!(expired.poll().is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_deadline() {
        let mut watchdog = InactivityWatchdog::new(Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(90)).await;
        watchdog.touch();

        // 90s after the touch the original deadline has long passed but the
        // refreshed one has not.
        let not_yet = tokio::time::timeout(Duration::from_secs(90), watchdog.expired()).await;
        assert!(not_yet.is_err());

        let expires = tokio::time::timeout(Duration::from_secs(31), watchdog.expired()).await;
        assert!(expires.is_ok());
    }
}
