//! Cubic-like window control.
//!
//! After a loss the window target follows `W(t) = C·(t-K)^3 + w_max`, with
//! `K = cbrt(w_max·(1-β)/C)` and `t` the time since the avoidance epoch
//! began. While the cubic target is behind the current window the controller
//! falls back to TCP-friendly linear growth.

use std::time::Duration;

use parking_lot::Mutex;

use crate::simulation::{RealTime, TimeSource};

use super::{CongestionControl, CongestionControlAlgorithm, CongestionControlStats};

/// Cubic scaling constant.
pub const CUBIC_C: f64 = 0.4;

/// Multiplicative decrease factor.
pub const CUBIC_BETA: f64 = 0.7;

#[derive(Debug)]
struct CubicState {
    window: usize,
    ssthresh: f64,
    w_max: f64,
    /// Start of the current avoidance epoch (nanoseconds).
    epoch_start: Option<u64>,
    ack_count: usize,
    peak_window: usize,
    successes: u64,
    timeouts: u64,
}

pub struct CubicController<T: TimeSource = RealTime> {
    state: Mutex<CubicState>,
    c: f64,
    beta: f64,
    max_window: usize,
    time_source: T,
}

impl CubicController<RealTime> {
    pub fn new(initial_window: usize, ssthresh: usize, max_window: usize) -> Self {
        Self::new_with_time_source(
            initial_window,
            ssthresh,
            max_window,
            CUBIC_C,
            CUBIC_BETA,
            RealTime::new(),
        )
    }
}

impl<T: TimeSource> CubicController<T> {
    pub fn new_with_time_source(
        initial_window: usize,
        ssthresh: usize,
        max_window: usize,
        c: f64,
        beta: f64,
        time_source: T,
    ) -> Self {
        let max_window = max_window.max(1);
        let window = initial_window.clamp(1, max_window);
        Self {
            state: Mutex::new(CubicState {
                window,
                ssthresh: ssthresh.max(1) as f64,
                w_max: 0.0,
                epoch_start: None,
                ack_count: 0,
                peak_window: window,
                successes: 0,
                timeouts: 0,
            }),
            c,
            beta,
            max_window,
            time_source,
        }
    }

    /// Window at the last loss.
    pub fn w_max(&self) -> f64 {
        self.state.lock().w_max
    }

    pub fn ssthresh(&self) -> f64 {
        self.state.lock().ssthresh
    }

    /// Cubic target `t` seconds into an epoch that began at `w_max`.
    fn target(&self, w_max: f64, t: f64) -> f64 {
        let k = (w_max * (1.0 - self.beta) / self.c).cbrt();
        self.c * (t - k).powi(3) + w_max
    }

    fn grow(&self, state: &mut CubicState) {
        state.window = (state.window + 1).min(self.max_window);
        state.peak_window = state.peak_window.max(state.window);
    }
}

impl<T: TimeSource> CongestionControl for CubicController<T> {
    fn on_round_success(&self) {
        let now = self.time_source.now_nanos();
        let mut state = self.state.lock();
        state.successes += 1;

        if (state.window as f64) < state.ssthresh {
            self.grow(&mut state);
            return;
        }

        let epoch_start = match state.epoch_start {
            Some(start) => start,
            None => {
                state.w_max = state.w_max.max(state.window as f64);
                state.ack_count = 0;
                state.epoch_start = Some(now);
                now
            }
        };
        let t = Duration::from_nanos(now.saturating_sub(epoch_start)).as_secs_f64();
        let target = self.target(state.w_max, t);

        if target < state.window as f64 {
            state.ack_count += 1;
            if state.ack_count >= state.window {
                state.ack_count = 0;
                self.grow(&mut state);
            }
        } else {
            self.grow(&mut state);
        }
    }

    fn on_round_success_with_rtt(&self, _rtt: Duration) {
        self.on_round_success();
    }

    fn on_round_timeout(&self) {
        let mut state = self.state.lock();
        state.timeouts += 1;
        state.w_max = state.window as f64;
        state.window =
            ((state.window as f64 * self.beta).floor() as usize).clamp(1, self.max_window);
        state.ssthresh = (state.w_max * self.beta).max(1.0);
        state.ack_count = 0;
        state.epoch_start = None;
    }

    fn window(&self) -> usize {
        self.state.lock().window.max(1)
    }

    fn stats(&self) -> CongestionControlStats {
        let state = self.state.lock();
        CongestionControlStats {
            algorithm: CongestionControlAlgorithm::Cubic,
            window: state.window.max(1),
            peak_window: state.peak_window,
            ssthresh: state.ssthresh as usize,
            successes: state.successes,
            timeouts: state.timeouts,
            min_rtt: None,
            bandwidth: None,
        }
    }

    fn algorithm(&self) -> CongestionControlAlgorithm {
        CongestionControlAlgorithm::Cubic
    }
}

impl<T: TimeSource> std::fmt::Debug for CubicController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubicController")
            .field("state", &*self.state.lock())
            .field("c", &self.c)
            .field("beta", &self.beta)
            .finish()
    }
}
