//! Deterministic simulation of an aggregation tree.
//!
//! Everything that would be nondeterministic in a real deployment goes
//! through this module:
//!
//! - **TimeSource**: real vs virtual time, shared with the congestion
//!   controllers
//! - **SimulationRng**: seeded RNG for every random decision
//! - **Scheduler**: event queue ordered by (timestamp, node, registration)
//! - **FaultConfig**: message loss, latency jitter, slow and crashed nodes
//! - **SimulatedNetwork**: name-based request routing and response return
//! - **AggregationSimulation**: wires a [`Config`](crate::config::Config)
//!   into nodes and runs them
//!
//! Two runs with the same configuration and seed produce the same
//! [`SimulationReport`].

mod fault;
mod harness;
mod network;
mod rng;
mod scheduler;
mod time;

pub use fault::{FaultConfig, FaultConfigBuilder};
pub use harness::{AggregationSimulation, NodeCompletions, SimulationReport};
pub use network::{NetworkStats, SimulatedNetwork};
pub use rng::SimulationRng;
pub use scheduler::{Event, EventId, EventType, NodeId, Scheduler};
pub use time::{RealTime, TimeSource, VirtualTime};
