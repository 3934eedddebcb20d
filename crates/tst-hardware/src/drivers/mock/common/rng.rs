//! Seeded RNG wrapper for reproducible behavior.
//!
//! Mock devices draw failure decisions and detector noise from a
//! [`MockRng`] so that tests can pin a seed and get the same run twice.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};

/// Seeded RNG wrapper for reproducible random behavior
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Check if an operation should fail given a failure probability in `[0, 1]`.
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform value in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().gen()
    }

    /// Poisson deviate with mean `lambda`; zero for a non-positive mean.
    pub fn next_poisson(&self, lambda: f64) -> u64 {
        match Poisson::new(lambda) {
            Ok(dist) => dist.sample(&mut *self.inner.lock()) as u64,
            Err(_) => 0,
        }
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let a = MockRng::new(Some(7));
        let b = MockRng::new(Some(7));
        for _ in 0..10 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
    }

    #[test]
    fn test_rate_edges() {
        let rng = MockRng::new(Some(1));
        assert!(!rng.should_fail(0.0));
        assert!(rng.should_fail(1.0));
    }

    #[test]
    fn test_poisson_mean_is_close() {
        let rng = MockRng::new(Some(42));
        let n = 2000;
        let total: u64 = (0..n).map(|_| rng.next_poisson(4.0)).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - 4.0).abs() < 0.3, "mean was {}", mean);
    }

    #[test]
    fn test_poisson_non_positive_mean_is_zero() {
        let rng = MockRng::new(Some(3));
        assert_eq!(rng.next_poisson(0.0), 0);
        assert_eq!(rng.next_poisson(-2.0), 0);
    }

    #[test]
    fn test_poisson_large_mean_is_close() {
        let rng = MockRng::new(Some(9));
        let n = 500;
        let total: u64 = (0..n).map(|_| rng.next_poisson(10_000.0)).sum();
        let mean = total as f64 / n as f64;
        assert!((mean - 10_000.0).abs() < 20.0, "mean was {}", mean);
    }
}
