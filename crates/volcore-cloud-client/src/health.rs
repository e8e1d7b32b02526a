//! Response-time observation for the cloud client.
//!
//! A ping sampled slow is "non-fatal but surfaced to health reporting":
//! we never turn a slow sample into an `Err`, just flag it and keep a
//! rolling window so State Recovery / the agent's health endpoint can
//! report it.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

const SLOW_THRESHOLD: Duration = Duration::from_secs(10);
const MAX_SAMPLES: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub latency: Duration,
    pub sampled_at: u64,
    pub slow: bool,
}

pub struct HealthTracker {
    samples: Mutex<VecDeque<HealthSample>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
        }
    }

    pub fn record(&self, latency: Duration, sampled_at: u64) {
        let slow = latency > SLOW_THRESHOLD;
        if slow {
            tracing::warn!(?latency, "cloud client response time exceeded slow threshold");
        }
        let mut samples = self.samples.lock();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(HealthSample {
            latency,
            sampled_at,
            slow,
        });
    }

    #[must_use]
    pub fn last_n(&self, n: usize) -> Vec<HealthSample> {
        let samples = self.samples.lock();
        samples.iter().rev().take(n).copied().collect()
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let samples = self.samples.lock();
        samples.iter().rev().take(5).filter(|s| s.slow).count() < 3
    }
}
