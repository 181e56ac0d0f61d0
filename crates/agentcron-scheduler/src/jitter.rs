use std::sync::Mutex;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Produces the random delay added to each computed occurrence.
pub trait JitterSource: Send + Sync {
    /// A value uniformly drawn from `[0, max_ms]`.
    fn jitter_ms(&self, max_ms: u64) -> u64;
}

/// Thread-local RNG; the production source.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter_ms(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=max_ms)
    }
}

/// Seeded RNG: the same seed yields the same jitter sequence.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn jitter_ms(&self, max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        rng.gen_range(0..=max_ms)
    }
}

/// Always zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter_ms(&self, _max_ms: u64) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_sources_agree() {
        let a = SeededJitter::new(7);
        let b = SeededJitter::new(7);
        let xs: Vec<u64> = (0..16).map(|_| a.jitter_ms(5_000)).collect();
        let ys: Vec<u64> = (0..16).map(|_| b.jitter_ms(5_000)).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().all(|&x| x <= 5_000));
    }

    #[test]
    fn zero_bound_is_zero() {
        assert_eq!(RandomJitter.jitter_ms(0), 0);
        assert_eq!(SeededJitter::new(1).jitter_ms(0), 0);
        assert_eq!(NoJitter.jitter_ms(10_000), 0);
    }
}
