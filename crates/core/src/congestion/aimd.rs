//! Additive-increase / multiplicative-decrease window control.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{CongestionControl, CongestionControlAlgorithm, CongestionControlStats};

/// AIMD controller.
///
/// Below `ssthresh` every success adds one round to the window; above it the
/// window grows by one after `window` successes. A timeout halves `ssthresh`
/// (from the current window) and restarts from a window of 1.
///
/// All state lives in atomics so the controller can be shared behind an `Arc`.
#[derive(Debug)]
pub struct AimdController {
    window: AtomicUsize,
    ssthresh: AtomicUsize,
    ack_count: AtomicUsize,
    max_window: usize,
    peak_window: AtomicUsize,
    successes: AtomicU64,
    timeouts: AtomicU64,
}

impl AimdController {
    pub fn new(initial_window: usize, ssthresh: usize, max_window: usize) -> Self {
        let max_window = max_window.max(1);
        let initial = initial_window.clamp(1, max_window);
        Self {
            window: AtomicUsize::new(initial),
            ssthresh: AtomicUsize::new(ssthresh.max(1)),
            ack_count: AtomicUsize::new(0),
            max_window,
            peak_window: AtomicUsize::new(initial),
            successes: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn ssthresh(&self) -> usize {
        self.ssthresh.load(Ordering::Acquire)
    }

    fn set_window(&self, window: usize) {
        let window = window.clamp(1, self.max_window);
        self.window.store(window, Ordering::Release);
        self.peak_window.fetch_max(window, Ordering::AcqRel);
    }
}

impl CongestionControl for AimdController {
    fn on_round_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let window = self.window.load(Ordering::Acquire);
        if window < self.ssthresh.load(Ordering::Acquire) {
            self.set_window(window + 1);
            return;
        }
        let acks = self.ack_count.fetch_add(1, Ordering::AcqRel) + 1;
        if acks >= window {
            self.ack_count.store(0, Ordering::Release);
            self.set_window(window + 1);
        }
    }

    fn on_round_success_with_rtt(&self, _rtt: Duration) {
        self.on_round_success();
    }

    fn on_round_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        let window = self.window.load(Ordering::Acquire);
        self.ssthresh.store((window / 2).max(1), Ordering::Release);
        self.ack_count.store(0, Ordering::Release);
        self.set_window(1);
    }

    fn window(&self) -> usize {
        self.window.load(Ordering::Acquire).max(1)
    }

    fn stats(&self) -> CongestionControlStats {
        CongestionControlStats {
            algorithm: CongestionControlAlgorithm::Aimd,
            window: self.window(),
            peak_window: self.peak_window.load(Ordering::Relaxed),
            ssthresh: self.ssthresh(),
            successes: self.successes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            min_rtt: None,
            bandwidth: None,
        }
    }

    fn algorithm(&self) -> CongestionControlAlgorithm {
        CongestionControlAlgorithm::Aimd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn three_successes_from_one_reach_four() {
        let aimd = AimdController::new(1, 10, 1000);
        for _ in 0..3 {
            aimd.on_round_success();
        }
        assert_eq!(aimd.window(), 4);
    }

    #[rstest]
    #[case(2)]
    #[case(10)]
    #[case(37)]
    fn ssthresh_successes_reach_ssthresh(#[case] ssthresh: usize) {
        let aimd = AimdController::new(1, ssthresh, 10_000);
        for _ in 0..ssthresh {
            aimd.on_round_success();
        }
        assert_eq!(aimd.window(), ssthresh);
    }

    #[test]
    fn avoidance_grows_once_per_window() {
        let aimd = AimdController::new(4, 4, 1000);
        for _ in 0..3 {
            aimd.on_round_success();
        }
        assert_eq!(aimd.window(), 4);
        aimd.on_round_success();
        assert_eq!(aimd.window(), 5);
        for _ in 0..4 {
            aimd.on_round_success();
        }
        assert_eq!(aimd.window(), 5);
        aimd.on_round_success();
        assert_eq!(aimd.window(), 6);
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(9, 4)]
    #[case(20, 10)]
    fn timeout_resets_window(#[case] window: usize, #[case] expected_ssthresh: usize) {
        let aimd = AimdController::new(window, 10_000, 10_000);
        aimd.on_round_timeout();
        assert_eq!(aimd.window(), 1);
        assert_eq!(aimd.ssthresh(), expected_ssthresh);
        assert_eq!(aimd.stats().timeouts, 1);
    }

    #[test]
    fn window_never_exceeds_max() {
        let aimd = AimdController::new(1, 100, 5);
        for _ in 0..50 {
            aimd.on_round_success();
        }
        assert_eq!(aimd.window(), 5);
        assert_eq!(aimd.stats().peak_window, 5);
    }
}
