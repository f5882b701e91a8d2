//! Fixed-interval retry with a pluggable sleep, so retry loops can be driven
//! through many cycles in tests without waiting on the wall clock.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;

#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records each requested delay and returns after a single yield.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.delays.lock().len()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

#[derive(Clone)]
pub struct FixedBackoff {
    interval: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self::with_sleeper(interval, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(interval: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { interval, sleeper }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait(&self) {
        self.sleeper.sleep(self.interval).await;
    }

    /// Run `op` until it succeeds. There is no attempt limit.
    pub async fn retry_forever<T, E, F, Fut>(&self, context: &str, mut op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return value,
                Err(err) => {
                    warn!(
                        "{} failed (attempt {}): {}. Retrying in {:?}",
                        context, attempt, err, self.interval
                    );
                    self.wait().await;
                }
            }
        }
    }

    /// Run `op` at most `attempts` times, returning the last error on exhaustion.
    pub async fn retry_bounded<T, E, F, Fut>(
        &self,
        context: &str,
        attempts: u32,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        context, attempt, attempts, err, self.interval
                    );
                    self.wait().await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_forever_sleeps_between_failures() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let backoff = FixedBackoff::with_sleeper(Duration::from_secs(1), sleeper.clone());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let value = backoff
            .retry_forever("flaky op", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                    Err("down")
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(sleeper.delays(), vec![Duration::from_secs(1); 4]);
    }

    #[tokio::test]
    async fn retry_bounded_gives_up_with_last_error() {
        let sleeper = Arc::new(RecordingSleeper::new());
        let backoff = FixedBackoff::with_sleeper(Duration::from_secs(1), sleeper.clone());
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), String> = backoff
            .retry_bounded("enqueue", 3, move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {n}"))
            })
            .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(sleeper.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_follows_the_paused_clock() {
        let backoff = FixedBackoff::new(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        backoff.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
