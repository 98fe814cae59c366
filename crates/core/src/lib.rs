//! Hierarchical in-network partial aggregation.
//!
//! A root issues aggregation rounds that fan out through aggregator tiers to
//! leaves; values are summed on the way back up. Rounds that lose children
//! finish as partial results when their straggler timer fires, and a
//! congestion controller decides how many rounds the root keeps in flight.

/// Round state machine, naming, payloads and observability events.
pub mod aggregation;

/// Window control for round admission at the root.
pub mod congestion;

/// Run configuration and topology validation.
pub mod config;

/// Root, aggregator and leaf roles.
pub mod node;

/// Deterministic simulation of a whole tree.
pub mod simulation;

/// Tracing and logging setup.
pub mod tracing;
