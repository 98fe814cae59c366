//! Congestion control for round admission at the root.
//!
//! A controller observes round outcomes and exposes how many rounds may be
//! in flight at once. Three algorithms are available behind one enum:
//!
//! - **AIMD**: slow start below `ssthresh`, then one extra round per window
//!   of successes; a timeout collapses the window to 1.
//! - **Cubic**: window follows `W(t) = C(t-K)^3 + w_max` after the last loss,
//!   with a TCP-friendly linear floor.
//! - **BBR**: window tracks `cwnd_gain × max delivery rate × min RTT`.
//!
//! Every controller keeps `window()` within `[1, max_window]`.
//!
//! ## Usage
//!
//! ```ignore
//! use cfnagg::congestion::{CongestionControl, CongestionControlAlgorithm, CongestionControlConfig};
//!
//! let controller = CongestionControlConfig::new(CongestionControlAlgorithm::Cubic).build();
//! controller.on_round_success();
//! assert!(controller.window() >= 1);
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::simulation::{RealTime, TimeSource};

mod aimd;
pub mod bbr;
mod cubic;

pub use aimd::AimdController;
pub use bbr::{BbrConfig, BbrController, DEFAULT_CWND_GAIN};
pub use cubic::{CubicController, CUBIC_BETA, CUBIC_C};

/// Initial slow start threshold shared by AIMD and Cubic.
pub const DEFAULT_SSTHRESH: usize = 10_000;

/// Default ceiling on the window.
pub const DEFAULT_MAX_WINDOW: usize = 65_536;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControlAlgorithm {
    #[default]
    Aimd,
    Cubic,
    Bbr,
}

impl fmt::Display for CongestionControlAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionControlAlgorithm::Aimd => write!(f, "AIMD"),
            CongestionControlAlgorithm::Cubic => write!(f, "CUBIC"),
            CongestionControlAlgorithm::Bbr => write!(f, "BBR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown congestion control algorithm `{0}` (expected aimd, cubic or bbr)")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for CongestionControlAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aimd" => Ok(Self::Aimd),
            "cubic" => Ok(Self::Cubic),
            "bbr" => Ok(Self::Bbr),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

/// How a round that ended by straggler timeout is reported to the controller.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PartialTimeoutPolicy {
    /// Any contribution counts as forward progress; total silence is a loss.
    #[default]
    ProgressIsSuccess,
    /// Every timeout is a loss, whatever was received.
    AnyTimeoutIsLoss,
}

impl PartialTimeoutPolicy {
    pub fn is_success(&self, received: u32) -> bool {
        match self {
            PartialTimeoutPolicy::ProgressIsSuccess => received > 0,
            PartialTimeoutPolicy::AnyTimeoutIsLoss => false,
        }
    }
}

impl fmt::Display for PartialTimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartialTimeoutPolicy::ProgressIsSuccess => write!(f, "progress-is-success"),
            PartialTimeoutPolicy::AnyTimeoutIsLoss => write!(f, "any-timeout-is-loss"),
        }
    }
}

/// Algorithm-agnostic controller statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CongestionControlStats {
    pub algorithm: CongestionControlAlgorithm,
    pub window: usize,
    pub peak_window: usize,
    /// Slow start threshold; BDP estimate for BBR.
    pub ssthresh: usize,
    pub successes: u64,
    pub timeouts: u64,
    pub min_rtt: Option<Duration>,
    /// Max delivery rate in rounds per second (BBR only).
    pub bandwidth: Option<f64>,
}

pub trait CongestionControl: Send + Sync {
    /// A round finished with forward progress.
    fn on_round_success(&self);

    /// Like [`on_round_success`](Self::on_round_success) with the round's
    /// observed round-trip time.
    fn on_round_success_with_rtt(&self, rtt: Duration);

    /// A round ended without progress.
    fn on_round_timeout(&self);

    /// Rounds allowed in flight; always at least 1.
    fn window(&self) -> usize;

    fn stats(&self) -> CongestionControlStats;

    fn algorithm(&self) -> CongestionControlAlgorithm;
}

/// Dispatches to the configured algorithm.
pub enum CongestionController<T: TimeSource = RealTime> {
    Aimd(AimdController),
    Cubic(CubicController<T>),
    Bbr(BbrController<T>),
}

impl<T: TimeSource> fmt::Debug for CongestionController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CongestionController")
            .field("algorithm", &self.algorithm())
            .field("window", &self.window())
            .finish_non_exhaustive()
    }
}

impl<T: TimeSource> CongestionControl for CongestionController<T> {
    fn on_round_success(&self) {
        match self {
            Self::Aimd(c) => c.on_round_success(),
            Self::Cubic(c) => c.on_round_success(),
            Self::Bbr(c) => c.on_round_success(),
        }
    }

    fn on_round_success_with_rtt(&self, rtt: Duration) {
        match self {
            Self::Aimd(c) => c.on_round_success_with_rtt(rtt),
            Self::Cubic(c) => c.on_round_success_with_rtt(rtt),
            Self::Bbr(c) => c.on_round_success_with_rtt(rtt),
        }
    }

    fn on_round_timeout(&self) {
        match self {
            Self::Aimd(c) => c.on_round_timeout(),
            Self::Cubic(c) => c.on_round_timeout(),
            Self::Bbr(c) => c.on_round_timeout(),
        }
    }

    fn window(&self) -> usize {
        match self {
            Self::Aimd(c) => c.window(),
            Self::Cubic(c) => c.window(),
            Self::Bbr(c) => c.window(),
        }
    }

    fn stats(&self) -> CongestionControlStats {
        match self {
            Self::Aimd(c) => c.stats(),
            Self::Cubic(c) => c.stats(),
            Self::Bbr(c) => c.stats(),
        }
    }

    fn algorithm(&self) -> CongestionControlAlgorithm {
        match self {
            Self::Aimd(_) => CongestionControlAlgorithm::Aimd,
            Self::Cubic(_) => CongestionControlAlgorithm::Cubic,
            Self::Bbr(_) => CongestionControlAlgorithm::Bbr,
        }
    }
}

/// Configuration for creating congestion controllers.
///
/// ```ignore
/// let controller = CongestionControlConfig::new(CongestionControlAlgorithm::Aimd)
///     .with_ssthresh(10)
///     .build();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CongestionControlConfig {
    pub algorithm: CongestionControlAlgorithm,
    pub initial_window: usize,
    pub ssthresh: usize,
    pub max_window: usize,
    pub algorithm_config: AlgorithmConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlgorithmConfig {
    Aimd,
    Cubic { c: f64, beta: f64 },
    Bbr(BbrConfig),
}

impl Default for CongestionControlConfig {
    fn default() -> Self {
        Self::new(CongestionControlAlgorithm::default())
    }
}

impl CongestionControlConfig {
    pub fn new(algorithm: CongestionControlAlgorithm) -> Self {
        let algorithm_config = match algorithm {
            CongestionControlAlgorithm::Aimd => AlgorithmConfig::Aimd,
            CongestionControlAlgorithm::Cubic => AlgorithmConfig::Cubic {
                c: CUBIC_C,
                beta: CUBIC_BETA,
            },
            CongestionControlAlgorithm::Bbr => AlgorithmConfig::Bbr(BbrConfig::default()),
        };
        Self {
            algorithm,
            initial_window: 1,
            ssthresh: DEFAULT_SSTHRESH,
            max_window: DEFAULT_MAX_WINDOW,
            algorithm_config,
        }
    }

    pub fn with_initial_window(mut self, window: usize) -> Self {
        self.initial_window = window;
        self
    }

    pub fn with_ssthresh(mut self, ssthresh: usize) -> Self {
        self.ssthresh = ssthresh;
        self
    }

    pub fn with_max_window(mut self, window: usize) -> Self {
        self.max_window = window;
        self
    }

    /// Overrides the Cubic constants; ignored by other algorithms.
    pub fn with_cubic_params(mut self, c: f64, beta: f64) -> Self {
        if let AlgorithmConfig::Cubic { .. } = self.algorithm_config {
            self.algorithm_config = AlgorithmConfig::Cubic { c, beta };
        }
        self
    }

    /// Overrides the BBR cwnd gain; ignored by other algorithms.
    pub fn with_bbr_cwnd_gain(mut self, gain: f64) -> Self {
        if let AlgorithmConfig::Bbr(bbr) = &mut self.algorithm_config {
            bbr.cwnd_gain = gain;
        }
        self
    }

    pub fn build(&self) -> CongestionController<RealTime> {
        self.build_with_time_source(RealTime::new())
    }

    /// Build with a custom time source, e.g. virtual time in simulations.
    pub fn build_with_time_source<T: TimeSource>(&self, time_source: T) -> CongestionController<T> {
        let max_window = self.max_window.max(1);
        let initial = self.initial_window.clamp(1, max_window);
        let ssthresh = self.ssthresh.max(1);
        match &self.algorithm_config {
            AlgorithmConfig::Aimd => {
                CongestionController::Aimd(AimdController::new(initial, ssthresh, max_window))
            }
            AlgorithmConfig::Cubic { c, beta } => CongestionController::Cubic(
                CubicController::new_with_time_source(
                    initial,
                    ssthresh,
                    max_window,
                    *c,
                    *beta,
                    time_source,
                ),
            ),
            AlgorithmConfig::Bbr(bbr) => CongestionController::Bbr(
                BbrController::new_with_time_source(
                    bbr.clone(),
                    initial,
                    max_window,
                    time_source,
                ),
            ),
        }
    }
}
