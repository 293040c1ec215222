use crate::infrastructure::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically drops expired rate limit windows, independent of traffic.
pub struct RateLimitSweeper {
    limiter: RateLimiter,
    interval: Duration,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_token: Mutex<CancellationToken>,
}

impl RateLimitSweeper {
    /// Intervals shorter than `MIN_SWEEP_INTERVAL` are raised to it.
    pub fn new(limiter: RateLimiter, interval: Duration) -> Self {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                "Rate limit sweep interval too short, using the minimum"
            );
        }
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        Self {
            limiter,
            interval,
            handle: Arc::new(Mutex::new(None)),
            shutdown_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Spawns the sweep task. Calling it while already running is a no-op.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        let token = {
            let mut token = self.shutdown_token.lock().await;
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let limiter = self.limiter.clone();
        let period = self.interval;

        info!(interval_secs = period.as_secs(), "Starting rate limit sweeper");

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; skip it so a fresh
            // process does not sweep an empty table.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = limiter.cleanup_expired();
                        debug!(removed, "Rate limit sweep finished");
                    }
                    _ = token.cancelled() => {
                        info!("Rate limit sweeper shutdown signal received");
                        break;
                    }
                }
            }
        }));
    }

    /// Cancels the sweep task and waits for it to exit.
    pub async fn stop(&self) {
        self.shutdown_token.lock().await.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one sweep on the caller's task.
    pub fn sweep_now(&self) -> usize {
        self.limiter.cleanup_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rate_limit::RateLimitRule;
    use crate::infrastructure::clock::ManualClock;
    use chrono::Utc;

    fn limiter(clock: &ManualClock) -> RateLimiter {
        let limiter = RateLimiter::new(Arc::new(clock.clone()));
        limiter.add_rule(
            "test",
            RateLimitRule::new(Duration::from_secs(1), 3, "x").unwrap(),
        );
        limiter
    }

    #[tokio::test]
    async fn sweep_now_removes_expired_entries() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock);
        limiter.check_client("1.2.3.4", "test");

        let sweeper = RateLimitSweeper::new(limiter.clone(), DEFAULT_SWEEP_INTERVAL);
        assert_eq!(sweeper.sweep_now(), 0);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(sweeper.sweep_now(), 1);
        assert_eq!(limiter.get_stats().total_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_sweeps_on_interval_until_stopped() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock);
        let sweeper = RateLimitSweeper::new(limiter.clone(), Duration::from_secs(300));

        sweeper.start().await;
        sweeper.start().await;
        assert!(sweeper.is_running().await);

        limiter.check_client("1.2.3.4", "test");
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(limiter.get_stats().total_entries, 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(limiter.get_stats().total_entries, 0);

        sweeper.stop().await;
        assert!(!sweeper.is_running().await);

        limiter.check_client("1.2.3.4", "test");
        clock.advance(chrono::Duration::seconds(2));
        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(limiter.get_stats().total_entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_the_minimum() {
        let clock = ManualClock::new(Utc::now());
        let limiter = limiter(&clock);
        let sweeper = RateLimitSweeper::new(limiter.clone(), Duration::ZERO);
        assert_eq!(sweeper.interval(), MIN_SWEEP_INTERVAL);

        sweeper.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sweeper.is_running().await);

        limiter.check_client("1.2.3.4", "test");
        clock.advance(chrono::Duration::seconds(2));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(limiter.get_stats().total_entries, 0);

        sweeper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn can_restart_after_stop() {
        let clock = ManualClock::new(Utc::now());
        let sweeper = RateLimitSweeper::new(limiter(&clock), Duration::from_secs(60));

        sweeper.start().await;
        sweeper.stop().await;
        sweeper.start().await;
        assert!(sweeper.is_running().await);
        sweeper.stop().await;
    }
}
