//! Randomness capability: a uniform integer in `[0, n]` milliseconds,
//! used to jitter probe/retry delays so hosts sharing a segment don't
//! lock-step.

use rand::{rngs::OsRng, Rng};

pub trait RandomSource {
    /// Uniformly distributed integer in `[0, n]` milliseconds. `n == 0`
    /// must return `0` (no jitter to add).
    fn uniform_ms(&mut self, n: u64) -> u64;
}

/// Default, OS-backed source, for live use.
#[derive(Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn uniform_ms(&mut self, n: u64) -> u64 {
        if n == 0 {
            0
        } else {
            OsRng.gen_range(0..=n)
        }
    }
}

/// A fixed, deterministic sequence for tests: replays the given values in
/// order, then repeats the last one forever.
pub struct FixedSequence {
    values: Vec<u64>,
    next: usize,
}

impl FixedSequence {
    pub fn new(values: Vec<u64>) -> Self {
        assert!(!values.is_empty(), "FixedSequence needs at least one value");
        Self { values, next: 0 }
    }

    pub fn constant(value: u64) -> Self {
        Self::new(vec![value])
    }
}

impl RandomSource for FixedSequence {
    fn uniform_ms(&mut self, _n: u64) -> u64 {
        let v = self.values[self.next.min(self.values.len() - 1)];
        if self.next < self.values.len() - 1 {
            self.next += 1;
        }
        v
    }
}
