//! Periodic task runner
//!
//! Runs a fallible task on a fixed interval. The first tick gets an optional
//! multiplicative jitter so a fleet restarting together does not hammer the
//! database in lockstep. Cycles that fail or exceed their timeout are logged
//! and swallowed; the loop only exits on shutdown.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::Error;

/// Interval, per-cycle timeout, and first-tick jitter for one worker
#[derive(Debug, Clone, Copy)]
pub struct PeriodicRunner {
    /// Time between cycle starts
    pub interval: Duration,
    /// Budget for one cycle
    pub timeout: Duration,
    /// First tick fires after `interval * (1 ± jitter)`; zero disables
    pub jitter: f64,
}

impl PeriodicRunner {
    /// Create a runner
    pub fn new(interval: Duration, timeout: Duration, jitter: f64) -> Self {
        Self {
            interval,
            timeout,
            jitter,
        }
    }

    /// Delay before the first tick
    fn first_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        self.interval.mul_f64(factor.max(0.0))
    }

    /// Run `task` until the shutdown signal fires
    pub async fn run<F, Fut>(
        &self,
        name: &'static str,
        mut shutdown: broadcast::Receiver<()>,
        mut task: F,
    ) where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let first = self.first_delay();
        tracing::debug!(task = name, delay_ms = first.as_millis() as u64, "First tick scheduled");
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(first) => {}
        }

        loop {
            let started = Instant::now();
            tokio::select! {
                _ = shutdown.recv() => return,
                result = tokio::time::timeout(self.timeout, task()) => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(task = name, error = %e, "Cycle failed; continuing")
                    }
                    Err(_) => tracing::warn!(
                        task = name,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Cycle timed out"
                    ),
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.interval {
                tracing::warn!(
                    task = name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    interval_ms = self.interval.as_millis() as u64,
                    "Cycle ran longer than its interval"
                );
            }

            let wait = self.interval.saturating_sub(elapsed);
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() {
        let runner = PeriodicRunner::new(Duration::from_secs(10), Duration::from_secs(5), 0.0);
        let (tx, rx) = broadcast::channel(1);
        let count = Arc::new(AtomicU32::new(0));

        let task_count = count.clone();
        let handle = tokio::spawn(async move {
            runner
                .run("test", rx, move || {
                    let count = task_count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        let _ = tx.send(());
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_survives_task_errors() {
        let runner = PeriodicRunner::new(Duration::from_secs(10), Duration::from_secs(5), 0.0);
        let (tx, rx) = broadcast::channel(1);
        let count = Arc::new(AtomicU32::new(0));

        let task_count = count.clone();
        let handle = tokio::spawn(async move {
            runner
                .run("failing", rx, move || {
                    let count = task_count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(Error::General("boom".to_string()))
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        let _ = tx.send(());
        handle.await.unwrap();

        // Failures do not stop the loop
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_first_tick() {
        let runner = PeriodicRunner::new(Duration::from_secs(60), Duration::from_secs(5), 0.0);
        let (tx, rx) = broadcast::channel(1);
        let count = Arc::new(AtomicU32::new(0));

        let task_count = count.clone();
        let handle = tokio::spawn(async move {
            runner
                .run("idle", rx, move || {
                    let count = task_count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = tx.send(());
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
