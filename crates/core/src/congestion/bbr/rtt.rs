//! Minimum round-trip tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A lock-free windowed minimum RTT.
///
/// A smaller sample always replaces the current minimum; a larger one only
/// once the current minimum is older than the filter window.
pub(crate) struct RttTracker {
    min_rtt_nanos: AtomicU64,
    min_rtt_stamp_nanos: AtomicU64,
    filter_window_nanos: u64,
}

impl RttTracker {
    pub(crate) fn new(filter_window: Duration) -> Self {
        Self {
            min_rtt_nanos: AtomicU64::new(u64::MAX),
            min_rtt_stamp_nanos: AtomicU64::new(0),
            filter_window_nanos: filter_window.as_nanos() as u64,
        }
    }

    /// Returns `true` if the sample became the new minimum.
    pub(crate) fn update(&self, rtt: Duration, now_nanos: u64) -> bool {
        let rtt_nanos = rtt.as_nanos() as u64;
        let current_min = self.min_rtt_nanos.load(Ordering::Acquire);
        let current_stamp = self.min_rtt_stamp_nanos.load(Ordering::Acquire);
        let expired = now_nanos.saturating_sub(current_stamp) > self.filter_window_nanos;

        if rtt_nanos < current_min || expired {
            self.min_rtt_nanos.store(rtt_nanos, Ordering::Release);
            self.min_rtt_stamp_nanos.store(now_nanos, Ordering::Release);
            return true;
        }
        false
    }

    pub(crate) fn min_rtt(&self) -> Option<Duration> {
        match self.min_rtt_nanos.load(Ordering::Acquire) {
            u64::MAX => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}

impl std::fmt::Debug for RttTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RttTracker")
            .field("min_rtt", &self.min_rtt())
            .field(
                "min_rtt_stamp_nanos",
                &self.min_rtt_stamp_nanos.load(Ordering::Relaxed),
            )
            .finish()
    }
}
