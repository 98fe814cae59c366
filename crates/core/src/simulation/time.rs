//! Time abstraction layer for deterministic simulation.
//!
//! - `TimeSource` trait for reading the current time
//! - `RealTime` backed by the monotonic clock
//! - `VirtualTime` that only moves when the simulation steps it

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Abstraction over clocks so the same controller code runs against real
/// and virtual time.
pub trait TimeSource: Send + Sync + Clone + 'static {
    /// Returns the current time as nanoseconds since an arbitrary epoch.
    fn now_nanos(&self) -> u64;

    /// Returns the current time as a Duration since an arbitrary epoch.
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }
}

/// Monotonic wall-clock time, measured from construction.
#[derive(Debug, Clone)]
pub struct RealTime {
    epoch: std::time::Instant,
}

impl Default for RealTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl TimeSource for RealTime {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Virtual time for deterministic simulation.
///
/// Clones share the same clock. Time only moves forward, and only through
/// [`VirtualTime::advance`] or [`VirtualTime::advance_to`].
#[derive(Debug, Clone)]
pub struct VirtualTime {
    current_nanos: Arc<AtomicU64>,
}

impl Default for VirtualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTime {
    /// Creates a new virtual time starting at 0.
    pub fn new() -> Self {
        Self::with_initial_time(0)
    }

    pub fn with_initial_time(initial_nanos: u64) -> Self {
        Self {
            current_nanos: Arc::new(AtomicU64::new(initial_nanos)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let step = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.current_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(step))
            })
            .ok();
    }

    /// Moves the clock to `target_nanos`. Returns `false` (and leaves the
    /// clock alone) if that would move it backwards.
    pub fn advance_to(&self, target_nanos: u64) -> bool {
        self.current_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                (target_nanos >= now).then_some(target_nanos)
            })
            .is_ok()
    }
}

impl TimeSource for VirtualTime {
    fn now_nanos(&self) -> u64 {
        self.current_nanos.load(Ordering::SeqCst)
    }
}
