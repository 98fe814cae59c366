//! BBR-like congestion control for round admission.
//!
//! A simplified take on BBR: the controller models the path as a
//! bottleneck delivery rate (rounds per second, windowed max) and a
//! propagation delay (windowed min RTT), and sizes the window to their
//! product scaled by `cwnd_gain`. There is no probe-bw or probe-rtt cycling.
//!
//! - **max_bw**: maximum delivery rate seen in the bandwidth window
//! - **min_rtt**: minimum round RTT seen in the RTT window
//! - **target**: `ceil(cwnd_gain × max_bw × min_rtt)`

mod bandwidth;
mod config;
mod controller;
mod rtt;

#[cfg(test)]
mod tests;

pub use config::{BbrConfig, DEFAULT_CWND_GAIN};
pub use controller::BbrController;
