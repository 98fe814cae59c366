//! BBR-like window control configuration and constants.

use std::time::Duration;

/// Default cwnd gain applied to the bandwidth-delay product. At 1.0 the
/// window is exactly `ceil(max_bw × min_rtt)`.
pub const DEFAULT_CWND_GAIN: f64 = 1.0;

/// Window over which the max delivery rate is kept.
pub(crate) const BW_FILTER_WINDOW: Duration = Duration::from_secs(10);

/// Window over which the min RTT is kept before a larger sample may replace it.
pub(crate) const MIN_RTT_FILTER_WINDOW: Duration = Duration::from_secs(10);

/// Number of delivery-rate samples the bandwidth filter retains.
pub(crate) const BW_FILTER_SIZE: usize = 10;

/// Delivery rates are stored as integers in units of 1/RATE_SCALE rounds/s.
pub(crate) const RATE_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct BbrConfig {
    /// Multiplier on `bandwidth × min_rtt` when computing the target window.
    pub cwnd_gain: f64,

    pub bw_window: Duration,

    pub min_rtt_window: Duration,
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            cwnd_gain: DEFAULT_CWND_GAIN,
            bw_window: BW_FILTER_WINDOW,
            min_rtt_window: MIN_RTT_FILTER_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BbrConfig::default();
        assert_eq!(config.cwnd_gain, 1.0);
        assert_eq!(config.bw_window, Duration::from_secs(10));
        assert_eq!(config.min_rtt_window, Duration::from_secs(10));
    }
}
