//! Seeded random number generator for deterministic simulation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// A thread-safe, seeded random number generator for simulation.
///
/// All random decisions during a run go through this RNG, so two runs with
/// the same seed make the same decisions as long as they ask in the same
/// order.
#[derive(Clone)]
pub struct SimulationRng {
    inner: Arc<Mutex<SmallRng>>,
    seed: u64,
}

impl SimulationRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SmallRng::seed_from_u64(seed))),
            seed,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns `true` with the given probability. Values outside `[0, 1]`
    /// are clamped.
    pub fn gen_bool(&self, probability: f64) -> bool {
        let p = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self.inner.lock().random_bool(p)
    }

    pub fn gen_u64(&self) -> u64 {
        self.inner.lock().random()
    }

    /// Generates a random Duration in `range`; an empty range yields its start.
    pub fn gen_duration(&self, range: std::ops::Range<Duration>) -> Duration {
        let start = range.start.as_nanos() as u64;
        let end = range.end.as_nanos() as u64;
        if end <= start {
            return range.start;
        }
        Duration::from_nanos(self.inner.lock().random_range(start..end))
    }
}

impl std::fmt::Debug for SimulationRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRng")
            .field("seed", &self.seed)
            .finish()
    }
}
