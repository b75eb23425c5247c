//! Exponential backoff with jitter around worker calls.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::error::EmbedError;

/// Retry tunables. Delay before attempt `k` (k ≥ 2) is
/// `min(max_delay, initial_delay * 2^(k-2)) * (1 + jitter)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter fraction.
    pub max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the `retry`-th retry (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let factor = 2u64.saturating_pow(exp);
        let delay = self.initial_delay.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }

    /// Backoff with a jitter fraction drawn from `[0, max_jitter]`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let jitter = if self.max_jitter > 0.0 {
            rng.gen_range(0.0..=self.max_jitter)
        } else {
            0.0
        };
        self.base_delay(retry).mul_f64(1.0 + jitter)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, socket: &Path, op: F) -> Result<T, EmbedError>
    where
        F: FnMut(u32) -> Result<T, EmbedError>,
    {
        self.run_with_sleep(socket, op, std::thread::sleep)
    }

    pub fn run_with_sleep<T, F, S>(&self, socket: &Path, mut op: F, mut sleep: S) -> Result<T, EmbedError>
    where
        F: FnMut(u32) -> Result<T, EmbedError>,
        S: FnMut(Duration),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut rng = rand::thread_rng();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, socket = %socket.display(), "Worker call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    warn!(
                        attempts = attempt,
                        socket = %socket.display(),
                        error = %err,
                        "Worker call retries exhausted"
                    );
                    return Err(EmbedError::RetriesExhausted {
                        socket: socket.to_path_buf(),
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.jittered_delay(attempt, &mut rng);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying worker call"
                    );
                    sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
