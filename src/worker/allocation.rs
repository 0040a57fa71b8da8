//! Allocation sampling decisions.
//!
//! The allocation tracepoint asks the policy, for every new object, whether it gets sampled and
//! with what weight. The weight is what the recorded `alloc-samples` value stands for.

use rand::Rng;

#[cfg_attr(test, mockall::automock)]
pub trait AllocationSamplingPolicy: Send + Sync {
    /// `Some(weight)` if the allocation numbered `allocation_count` on this thread is sampled
    fn sample_weight(&self, allocation_count: u64) -> Option<u32>;
}

/// Sample every `n`th allocation, each one standing for `n` allocations. `0` disables sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EveryNth {
    n: u64,
}

impl EveryNth {
    pub fn new(n: u64) -> Self {
        Self { n }
    }
}

impl AllocationSamplingPolicy for EveryNth {
    fn sample_weight(&self, allocation_count: u64) -> Option<u32> {
        if self.n > 0 && allocation_count % self.n == 0 {
            Some(u32::try_from(self.n).unwrap_or(u32::MAX))
        } else {
            None
        }
    }
}

/// Sample each allocation independently with a fixed probability
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probabilistic {
    probability: f64,
    weight: u32,
}

impl Probabilistic {
    /// `probability` is clamped to `[0, 1]`
    pub fn new(probability: f64) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        let weight = if probability > 0.0 {
            (1.0 / probability).round().min(u32::MAX as f64) as u32
        } else {
            0
        };

        Self {
            probability,
            weight,
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }
}

impl AllocationSamplingPolicy for Probabilistic {
    fn sample_weight(&self, _allocation_count: u64) -> Option<u32> {
        if self.probability <= 0.0 {
            return None;
        }
        rand::rng()
            .random_bool(self.probability)
            .then_some(self.weight)
    }
}
