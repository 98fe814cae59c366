//! Delivery-rate estimation using a windowed maximum filter.
//!
//! The bottleneck rate is the maximum delivery rate (rounds per second)
//! observed over a recent time window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::config::{BW_FILTER_SIZE, RATE_SCALE};

/// A lock-free windowed maximum filter.
///
/// Ring buffer of (rate, timestamp) samples; the maximum is taken over
/// samples whose timestamp falls inside the window.
pub(crate) struct BandwidthFilter {
    /// Rates in 1/RATE_SCALE rounds per second.
    samples: [AtomicU64; BW_FILTER_SIZE],
    timestamps: [AtomicU64; BW_FILTER_SIZE],
    write_idx: AtomicU64,
    window_nanos: u64,
}

impl BandwidthFilter {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) fn new(window: Duration) -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            samples: [ZERO; BW_FILTER_SIZE],
            timestamps: [ZERO; BW_FILTER_SIZE],
            write_idx: AtomicU64::new(0),
            window_nanos: window.as_nanos() as u64,
        }
    }

    /// Records a delivery rate in rounds per second.
    pub(crate) fn update(&self, rounds_per_sec: f64, now_nanos: u64) {
        let scaled = (rounds_per_sec * RATE_SCALE).round();
        let scaled = if scaled.is_finite() && scaled > 0.0 {
            scaled.min(u64::MAX as f64) as u64
        } else {
            0
        };
        let idx = self.write_idx.fetch_add(1, Ordering::AcqRel) as usize % BW_FILTER_SIZE;
        self.samples[idx].store(scaled, Ordering::Release);
        self.timestamps[idx].store(now_nanos, Ordering::Release);
    }

    /// Maximum rate among non-expired samples, in rounds per second.
    pub(crate) fn max_bw(&self, now_nanos: u64) -> f64 {
        let cutoff = now_nanos.saturating_sub(self.window_nanos);
        let mut max = 0u64;
        for i in 0..BW_FILTER_SIZE {
            if self.timestamps[i].load(Ordering::Acquire) >= cutoff {
                max = max.max(self.samples[i].load(Ordering::Acquire));
            }
        }
        max as f64 / RATE_SCALE
    }

    pub(crate) fn reset(&self) {
        for i in 0..BW_FILTER_SIZE {
            self.samples[i].store(0, Ordering::Release);
            self.timestamps[i].store(0, Ordering::Release);
        }
        self.write_idx.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for BandwidthFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthFilter")
            .field("window_nanos", &self.window_nanos)
            .field("write_idx", &self.write_idx.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_bandwidth_filter_windowed_max() {
        let filter = BandwidthFilter::new(Duration::from_secs(5));

        filter.update(1.0, SEC);
        filter.update(5.0, 2 * SEC);
        filter.update(3.0, 3 * SEC);

        assert_eq!(filter.max_bw(4 * SEC), 5.0);
        assert_eq!(filter.max_bw(7 * SEC), 5.0);
        // Only the 3s sample remains.
        assert_eq!(filter.max_bw(8 * SEC), 3.0);
    }

    #[test]
    fn test_bandwidth_filter_expiration() {
        let filter = BandwidthFilter::new(Duration::from_secs(5));
        filter.update(2.5, 0);
        assert_eq!(filter.max_bw(4 * SEC), 2.5);
        assert_eq!(filter.max_bw(6 * SEC), 0.0);
    }

    #[test]
    fn test_bandwidth_filter_reset() {
        let filter = BandwidthFilter::new(Duration::from_secs(10));
        filter.update(10.0, SEC);
        filter.reset();
        assert_eq!(filter.max_bw(2 * SEC), 0.0);
    }

    #[test]
    fn test_ring_buffer_overwrites_oldest() {
        let filter = BandwidthFilter::new(Duration::from_secs(100));
        filter.update(50.0, SEC);
        for i in 0..BW_FILTER_SIZE as u64 {
            filter.update(1.0, (2 + i) * SEC);
        }
        assert_eq!(filter.max_bw(20 * SEC), 1.0);
    }
}
