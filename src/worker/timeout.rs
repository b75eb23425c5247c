//! Adaptive per-call timeout derived from recent response latencies.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

/// Number of latency samples kept.
pub const SAMPLE_WINDOW: usize = 20;

/// Below this many samples the fixed initial timeout is used.
pub const MIN_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBounds {
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for TimeoutBounds {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(120),
            min: Duration::from_secs(30),
            max: Duration::from_secs(300),
        }
    }
}

/// Rolling-window timeout controller: `mean + 3σ`, clamped to `[min, max]`.
///
/// The timeout is applied as an idle timeout, so it bounds the gap between
/// bytes from the worker rather than the whole call.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    bounds: TimeoutBounds,
    samples: Mutex<VecDeque<u64>>,
}

impl AdaptiveTimeout {
    pub fn new(mut bounds: TimeoutBounds) -> Self {
        if bounds.min > bounds.max {
            warn!(
                min_ms = bounds.min.as_millis() as u64,
                max_ms = bounds.max.as_millis() as u64,
                "Timeout minimum exceeds maximum, raising maximum"
            );
            bounds.max = bounds.min;
        }
        Self {
            bounds,
            samples: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
        }
    }

    pub fn bounds(&self) -> TimeoutBounds {
        self.bounds
    }

    /// Record a successful response time; the oldest sample falls out once the window is full.
    pub fn record_sample(&self, response_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == SAMPLE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(response_ms);
    }

    pub fn record(&self, elapsed: Duration) {
        self.record_sample(elapsed.as_millis().min(u128::from(u64::MAX)) as u64);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn get_timeout(&self) -> Duration {
        let samples = self.samples.lock();
        if samples.len() < MIN_SAMPLES {
            return self.bounds.initial;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
        let variance = samples
            .iter()
            .map(|&s| {
                let d = s as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let ms = mean + 3.0 * variance.sqrt();
        Duration::from_secs_f64(ms.max(0.0) / 1000.0)
            .max(self.bounds.min)
            .min(self.bounds.max)
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self::new(TimeoutBounds::default())
    }
}
