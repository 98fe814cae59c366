//! BBR-like window controller.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::congestion::{CongestionControl, CongestionControlAlgorithm, CongestionControlStats};
use crate::simulation::{RealTime, TimeSource};

use super::bandwidth::BandwidthFilter;
use super::config::BbrConfig;
use super::rtt::RttTracker;

/// BBR-like controller.
///
/// Every success delivers one round. Delivery rate samples
/// (`delivered / interval`) feed a windowed max filter, and successes that
/// carry an RTT feed a windowed min-RTT tracker. Once a min RTT is known the
/// window is raised to `ceil(cwnd_gain × max_bw × min_rtt)` whenever that
/// target exceeds it; before that, each success adds one.
///
/// A timeout halves the window and discards the bandwidth model.
///
/// ## Thread Safety
///
/// All state is held in atomics.
pub struct BbrController<T: TimeSource = RealTime> {
    config: BbrConfig,
    bw_filter: BandwidthFilter,
    rtt_tracker: RttTracker,
    window: AtomicUsize,
    max_window: usize,
    peak_window: AtomicUsize,
    /// Rounds delivered since the last rate sample.
    delivered: AtomicU64,
    last_sample_nanos: AtomicU64,
    successes: AtomicU64,
    timeouts: AtomicU64,
    time_source: T,
}

impl BbrController<RealTime> {
    pub fn new(config: BbrConfig, initial_window: usize, max_window: usize) -> Self {
        Self::new_with_time_source(config, initial_window, max_window, RealTime::new())
    }
}

impl<T: TimeSource> BbrController<T> {
    pub fn new_with_time_source(
        config: BbrConfig,
        initial_window: usize,
        max_window: usize,
        time_source: T,
    ) -> Self {
        let max_window = max_window.max(1);
        let initial = initial_window.clamp(1, max_window);
        let now = time_source.now_nanos();
        Self {
            bw_filter: BandwidthFilter::new(config.bw_window),
            rtt_tracker: RttTracker::new(config.min_rtt_window),
            config,
            window: AtomicUsize::new(initial),
            max_window,
            peak_window: AtomicUsize::new(initial),
            delivered: AtomicU64::new(0),
            last_sample_nanos: AtomicU64::new(now),
            successes: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            time_source,
        }
    }

    pub fn config(&self) -> &BbrConfig {
        &self.config
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.rtt_tracker.min_rtt()
    }

    /// Max delivery rate in rounds per second.
    pub fn max_bw(&self) -> f64 {
        self.bw_filter.max_bw(self.time_source.now_nanos())
    }

    /// `ceil(cwnd_gain × max_bw × min_rtt)`, if a min RTT is known.
    pub fn target_window(&self) -> Option<usize> {
        let min_rtt = self.rtt_tracker.min_rtt()?;
        let bdp = self.config.cwnd_gain * self.max_bw() * min_rtt.as_secs_f64();
        Some(bdp.ceil().max(0.0) as usize)
    }

    fn set_window(&self, window: usize) {
        let window = window.clamp(1, self.max_window);
        self.window.store(window, Ordering::Release);
        self.peak_window.fetch_max(window, Ordering::AcqRel);
    }

    fn sample_delivery(&self, now_nanos: u64) {
        let delivered = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        let last = self.last_sample_nanos.load(Ordering::Acquire);
        let interval = now_nanos.saturating_sub(last);
        if interval == 0 {
            // Keep accumulating until time has moved.
            return;
        }
        let rate = delivered as f64 / Duration::from_nanos(interval).as_secs_f64();
        self.bw_filter.update(rate, now_nanos);
        self.delivered.store(0, Ordering::Release);
        self.last_sample_nanos.store(now_nanos, Ordering::Release);
    }

    fn on_delivery(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let now = self.time_source.now_nanos();
        self.sample_delivery(now);

        let window = self.window.load(Ordering::Acquire);
        match self.target_window() {
            Some(target) if target > window => {
                tracing::trace!(window, target, "BBR window raised to BDP target");
                self.set_window(target);
            }
            Some(_) => {}
            None => self.set_window(window + 1),
        }
    }
}

impl<T: TimeSource> CongestionControl for BbrController<T> {
    fn on_round_success(&self) {
        self.on_delivery();
    }

    fn on_round_success_with_rtt(&self, rtt: Duration) {
        self.rtt_tracker.update(rtt, self.time_source.now_nanos());
        self.on_delivery();
    }

    fn on_round_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        let window = self.window.load(Ordering::Acquire);
        self.set_window(window / 2);
        self.bw_filter.reset();
        self.delivered.store(0, Ordering::Release);
        self.last_sample_nanos
            .store(self.time_source.now_nanos(), Ordering::Release);
    }

    fn window(&self) -> usize {
        self.window.load(Ordering::Acquire).max(1)
    }

    fn stats(&self) -> CongestionControlStats {
        CongestionControlStats {
            algorithm: CongestionControlAlgorithm::Bbr,
            window: self.window(),
            peak_window: self.peak_window.load(Ordering::Relaxed),
            ssthresh: self.target_window().unwrap_or(0),
            successes: self.successes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            min_rtt: self.min_rtt(),
            bandwidth: Some(self.max_bw()),
        }
    }

    fn algorithm(&self) -> CongestionControlAlgorithm {
        CongestionControlAlgorithm::Bbr
    }
}

impl<T: TimeSource> std::fmt::Debug for BbrController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BbrController")
            .field("window", &self.window())
            .field("bw_filter", &self.bw_filter)
            .field("rtt_tracker", &self.rtt_tracker)
            .finish_non_exhaustive()
    }
}
