//! Reconnect retrier with exponential backoff
//!
//! Delay for attempt *n* is `interval × coeff^n`, the attempt counter is
//! capped at 10 and resets whenever the wrapped operation reports progress
//! (any successfully received message).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::Result;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub backoff_coeff: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            backoff_coeff: 2.0,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.interval
            .mul_f64(self.backoff_coeff.powi(attempt as i32))
    }
}

/// Drives an operation until it succeeds or the attempt cap is hit
pub struct Retrier {
    policy: RetryPolicy,
    progress: Arc<AtomicBool>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_progress(policy, Arc::new(AtomicBool::new(false)))
    }

    /// Share an externally owned progress flag
    pub fn with_progress(policy: RetryPolicy, progress: Arc<AtomicBool>) -> Self {
        Self { policy, progress }
    }

    /// Flag the wrapped operation sets on any successful receive; resets the
    /// attempt counter
    pub fn progress_flag(&self) -> Arc<AtomicBool> {
        self.progress.clone()
    }

    pub async fn run<F, Fut>(&self, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if self.progress.swap(false, Ordering::SeqCst) {
                        attempt = 0;
                    }
                    attempt += 1;
                    if attempt > self.policy.max_attempts {
                        return Err(e);
                    }
                    let delay = self.policy.delay(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "replication stream failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
