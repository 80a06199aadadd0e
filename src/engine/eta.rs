//! Time-to-completion estimate from recent per-item durations.

use std::collections::VecDeque;
use std::time::Duration;

/// Bounded history of item durations, averaged with exponential decay so
/// recent samples dominate.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    samples: VecDeque<Duration>,
    capacity: usize,
    decay: f64,
}

impl EtaEstimator {
    pub fn new(capacity: usize, decay: f64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(128)),
            capacity: capacity.max(1),
            decay: decay.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Weighted mean: the newest sample has weight 1, the one before it
    /// `decay`, then `decay^2`, and so on.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut weight = 1.0;
        let mut total = 0.0;
        let mut weights = 0.0;
        for sample in self.samples.iter().rev() {
            total += sample.as_secs_f64() * weight;
            weights += weight;
            weight *= self.decay;
        }
        Duration::try_from_secs_f64(total / weights).ok()
    }

    /// `average * pending`. Unknown until at least one sample exists.
    pub fn estimate(&self, pending: u32) -> Option<Duration> {
        self.average().map(|avg| avg.mul_f64(f64::from(pending)))
    }
}
