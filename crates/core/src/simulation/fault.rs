//! Fault injection configuration for simulation testing.
//!
//! - Message loss (random drops)
//! - Link latency with jitter
//! - Slow nodes (extra delay on everything they send)
//! - Node crashes

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    time::Duration,
};

use super::rng::SimulationRng;
use super::scheduler::NodeId;

/// Configuration for fault injection during simulation.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of dropping a message (0.0 to 1.0)
    pub message_loss_rate: f64,
    /// Per-message link latency; a single-point range means no jitter.
    pub latency_range: Option<Range<Duration>>,
    /// Crashed nodes neither send nor receive.
    pub crashed_nodes: HashSet<NodeId>,
    /// Added to the latency of every message the node sends.
    pub extra_delay: HashMap<NodeId, Duration>,
}

impl FaultConfig {
    /// No faults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> FaultConfigBuilder {
        FaultConfigBuilder::new()
    }

    pub fn should_drop_message(&self, rng: &SimulationRng) -> bool {
        self.message_loss_rate > 0.0 && rng.gen_bool(self.message_loss_rate)
    }

    /// Latency for one message sent by `from`.
    pub fn generate_latency(&self, from: NodeId, rng: &SimulationRng) -> Duration {
        let link = match &self.latency_range {
            Some(range) => rng.gen_duration(range.clone()),
            None => Duration::ZERO,
        };
        link + self.extra_delay(from)
    }

    pub fn extra_delay(&self, node: NodeId) -> Duration {
        self.extra_delay.get(&node).copied().unwrap_or_default()
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.crashed_nodes.contains(&node)
    }

    /// Checks crash state first, then rolls for random loss. The loss roll
    /// only consumes randomness when both ends are up.
    pub fn can_deliver(&self, from: NodeId, to: NodeId, rng: &SimulationRng) -> bool {
        if self.is_crashed(from) || self.is_crashed(to) {
            return false;
        }
        !self.should_drop_message(rng)
    }

    pub fn crash_node(&mut self, node: NodeId) {
        self.crashed_nodes.insert(node);
    }
}

/// Builder for fault configuration.
#[derive(Debug, Default)]
pub struct FaultConfigBuilder {
    config: FaultConfig,
}

impl FaultConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the message loss rate, clamped to `[0, 1]`.
    pub fn message_loss_rate(mut self, rate: f64) -> Self {
        self.config.message_loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn latency_range(mut self, range: Range<Duration>) -> Self {
        self.config.latency_range = Some(range);
        self
    }

    /// `base` latency plus uniform jitter in `[0, jitter)`.
    pub fn latency_with_jitter(self, base: Duration, jitter: Duration) -> Self {
        self.latency_range(base..base + jitter)
    }

    pub fn crashed_node(mut self, node: NodeId) -> Self {
        self.config.crashed_nodes.insert(node);
        self
    }

    pub fn extra_delay(mut self, node: NodeId, delay: Duration) -> Self {
        if delay.is_zero() {
            self.config.extra_delay.remove(&node);
        } else {
            self.config.extra_delay.insert(node, delay);
        }
        self
    }

    pub fn build(self) -> FaultConfig {
        self.config
    }
}
