//! Runs a whole aggregation tree on the deterministic scheduler.
//!
//! Every node of a validated [`Config`] becomes a [`Node`] driven by events
//! popped from the [`Scheduler`]. Roles see the simulation through
//! [`SimContext`], which turns their timers into scheduler events and their
//! messages into network sends.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;

use crate::aggregation::observer::FanoutObserver;
use crate::aggregation::{
    AggregationEvent, AggregationObserver, Completion, Message, ObservedEvent, RequestId,
    SequenceId, TimerHandle, TimerService,
};
use crate::config::{Config, ConfigError, RoleKind};
use crate::congestion::{CongestionControl, CongestionControlAlgorithm, CongestionControlStats};
use crate::node::{AggregatorRole, LeafRole, Node, NodeError, NodeRole, RootRole, RootStats, Transport};

use super::{
    fault::FaultConfig,
    network::{NetworkStats, SimulatedNetwork},
    scheduler::{Event, EventId, EventType, NodeId, Scheduler},
    time::{TimeSource, VirtualTime},
};

/// Host context handed to a node while it handles one event.
struct SimContext<'a> {
    node: NodeId,
    scheduler: &'a mut Scheduler,
    network: &'a mut SimulatedNetwork,
}

impl TimerService for SimContext<'_> {
    fn now(&self) -> Duration {
        self.scheduler.time().now()
    }

    fn schedule_after(&mut self, delay: Duration, seq: SequenceId) -> TimerHandle {
        let id = self.scheduler.schedule_after(
            delay,
            EventType::Timer {
                node: self.node,
                seq,
            },
        );
        TimerHandle::new(id.as_u64())
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.scheduler.cancel(EventId::new(handle.as_u64()))
    }
}

impl Transport for SimContext<'_> {
    fn send(&mut self, message: Message) {
        self.network.send(self.node, message, self.scheduler);
    }

    fn next_request_id(&mut self) -> RequestId {
        self.network.next_request_id()
    }
}

/// Rounds finished by one node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeCompletions {
    pub full: u64,
    pub partial: u64,
}

#[derive(Debug, Default)]
struct CompletionCounter {
    counts: Mutex<BTreeMap<String, NodeCompletions>>,
}

impl AggregationObserver for CompletionCounter {
    fn on_event(&self, event: &ObservedEvent) {
        if let AggregationEvent::RoundCompleted { completion, .. } = event.event {
            let mut counts = self.counts.lock();
            let entry = counts.entry(event.node.to_string()).or_default();
            match completion {
                Completion::Full => entry.full += 1,
                Completion::Partial => entry.partial += 1,
            }
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    /// Virtual time when the run ended.
    pub end_time_ms: u64,
    pub events_processed: u64,
    pub algorithm: CongestionControlAlgorithm,
    pub root: RootStats,
    pub congestion: CongestionControlStats,
    pub network: NetworkStats,
    /// Completed rounds per node, keyed by name.
    pub completions: BTreeMap<String, NodeCompletions>,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "seed {} | {} | virtual time {:.3}s | {} events",
            self.seed,
            self.algorithm,
            self.end_time_ms as f64 / 1000.0,
            self.events_processed
        )?;
        writeln!(
            f,
            "root: launched {} full {} partial {} rejected {} last sum {} (confidence {})",
            self.root.launched,
            self.root.completed_full,
            self.root.completed_partial,
            self.root.rejected,
            self.root
                .last_sum
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            self.root
                .last_confidence
                .map(|c| format!("{c:.2}"))
                .unwrap_or_else(|| "-".into())
        )?;
        writeln!(
            f,
            "window: current {} peak {} ssthresh {} ({} successes, {} timeouts)",
            self.congestion.window,
            self.congestion.peak_window,
            self.congestion.ssthresh,
            self.congestion.successes,
            self.congestion.timeouts
        )?;
        writeln!(
            f,
            "network: sent {} delivered {} dropped {} unroutable {} avg latency {:?}",
            self.network.messages_sent,
            self.network.messages_delivered,
            self.network.messages_dropped,
            self.network.messages_unroutable,
            self.network.average_latency()
        )?;
        for (node, done) in &self.completions {
            writeln!(f, "  {node}: {} full, {} partial", done.full, done.partial)?;
        }
        Ok(())
    }
}

/// A full aggregation tree on simulated time and network.
pub struct AggregationSimulation {
    scheduler: Scheduler,
    network: SimulatedNetwork,
    nodes: Vec<Node<VirtualTime>>,
    root: NodeId,
    stop_time: Duration,
    counter: Arc<CompletionCounter>,
    stopped: bool,
}

impl AggregationSimulation {
    /// Builds the tree described by `config`. Every event is also reported to
    /// `observer`.
    pub fn new(config: &Config, observer: Arc<dyn AggregationObserver>) -> Result<Self, ConfigError> {
        config.validate()?;

        let scheduler = Scheduler::new(config.simulation.seed);
        let counter = Arc::new(CompletionCounter::default());
        let observer: Arc<dyn AggregationObserver> = Arc::new(
            FanoutObserver::new()
                .with(counter.clone())
                .with(observer),
        );

        let names: Vec<Arc<str>> = config
            .nodes
            .iter()
            .map(|n| Arc::<str>::from(n.name.as_str()))
            .collect();

        let mut faults = FaultConfig::builder()
            .message_loss_rate(config.simulation.loss_rate)
            .latency_with_jitter(
                config.simulation.link_latency(),
                config.simulation.latency_jitter(),
            );
        for (idx, spec) in config.nodes.iter().enumerate() {
            if spec.crashed {
                faults = faults.crashed_node(NodeId(idx));
            }
            faults = faults.extra_delay(NodeId(idx), spec.extra_delay());
        }

        let aggregation = &config.aggregation;
        let mut root = NodeId(0);
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (idx, (spec, name)) in config.nodes.iter().zip(&names).enumerate() {
            let role: NodeRole<VirtualTime> = match spec.role {
                RoleKind::Root => {
                    root = NodeId(idx);
                    let controller = config
                        .congestion
                        .to_congestion_config()
                        .build_with_time_source(scheduler.time().clone());
                    RootRole::new(
                        name.clone(),
                        spec.children.clone(),
                        aggregation.buffer_capacity,
                        aggregation.child_timeout(),
                        controller,
                        aggregation.partial_timeout_policy,
                        aggregation.rounds,
                        observer.clone(),
                    )
                    .into()
                }
                RoleKind::Aggregator => AggregatorRole::new(
                    name.clone(),
                    spec.children.clone(),
                    aggregation.buffer_capacity,
                    aggregation.child_timeout(),
                    observer.clone(),
                )
                .into(),
                RoleKind::Leaf => LeafRole::new(name.clone(), spec.value).into(),
            };
            nodes.push(Node::new(name.clone(), role));
        }

        let mut sim = Self {
            scheduler,
            network: SimulatedNetwork::new(names).with_faults(faults.build()),
            nodes,
            root,
            stop_time: config.simulation.stop_time(),
            counter,
            stopped: false,
        };
        for idx in 0..sim.nodes.len() {
            sim.scheduler
                .schedule_at(0, EventType::Start { node: NodeId(idx) });
        }
        tracing::info!(
            nodes = sim.nodes.len(),
            seed = config.simulation.seed,
            algorithm = %config.congestion.algorithm,
            stop_ms = config.simulation.stop_time_ms,
            "Simulation ready"
        );
        Ok(sim)
    }

    pub fn now(&self) -> Duration {
        self.scheduler.time().now()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn nodes(&self) -> &[Node<VirtualTime>] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node<VirtualTime>> {
        let id = self.network.node_id(name)?;
        self.nodes.get(id.0)
    }

    pub fn root(&self) -> Option<&RootRole<VirtualTime>> {
        self.nodes.get(self.root.0).and_then(Node::as_root)
    }

    /// Crashes a node mid-run. Messages in flight to it are dropped on arrival
    /// and its pending timers are ignored.
    pub fn crash(&mut self, name: &str) -> bool {
        match self.network.node_id(name) {
            Some(id) => {
                tracing::info!(node = name, "Crashing node");
                self.network.fault_config_mut().crash_node(id);
                true
            }
            None => false,
        }
    }

    fn root_done(&self) -> bool {
        self.root().is_some_and(RootRole::is_done)
    }

    /// Handles one event. Returns `false` when nothing is left to do.
    pub fn step(&mut self) -> Result<bool, NodeError> {
        match self.scheduler.step() {
            Some(event) => {
                self.dispatch(event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<(), NodeError> {
        let target = event.event_type.target();
        let Some(node) = self.nodes.get_mut(target.0) else {
            tracing::warn!(%target, "Event for unknown node");
            return Ok(());
        };

        if let EventType::Deliver { to, .. } = &event.event_type {
            if !self.network.process_delivery(*to) {
                return Ok(());
            }
        } else if self.network.fault_config().is_crashed(target) {
            tracing::trace!(node = %node.name(), "Skipping event for crashed node");
            return Ok(());
        }

        let mut ctx = SimContext {
            node: target,
            scheduler: &mut self.scheduler,
            network: &mut self.network,
        };
        match event.event_type {
            EventType::Start { .. } => node.on_start(&mut ctx)?,
            EventType::Deliver { message, .. } => node.on_message(message, &mut ctx),
            EventType::Timer { seq, .. } => {
                node.on_timer(seq, TimerHandle::new(event.id.as_u64()), &mut ctx)
            }
        }
        Ok(())
    }

    /// Processes events up to virtual time `stop`, or until the root has
    /// spent its round budget and every round finished.
    pub fn run_until(&mut self, stop: Duration) -> Result<(), NodeError> {
        let target = u64::try_from(stop.as_nanos()).unwrap_or(u64::MAX);
        while !self.root_done() {
            match self.scheduler.step_until(target) {
                Some(event) => self.dispatch(event)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Runs to the configured stop time, shuts every node down and reports.
    pub fn run(&mut self) -> Result<SimulationReport, NodeError> {
        self.run_until(self.stop_time)?;
        self.stop();
        Ok(self.report())
    }

    /// Like [`run_until`](Self::run_until), but sleeps between events so
    /// virtual time tracks the wall clock, sped up by `speedup`.
    pub async fn run_paced(&mut self, stop: Duration, speedup: f64) -> Result<(), NodeError> {
        let speedup = if speedup.is_finite() && speedup > 0.0 {
            speedup
        } else {
            1.0
        };
        let target = u64::try_from(stop.as_nanos()).unwrap_or(u64::MAX);
        while !self.root_done() {
            let Some(next) = self.scheduler.next_event_time() else {
                break;
            };
            if next > target {
                break;
            }
            let gap = Duration::from_nanos(next.saturating_sub(self.scheduler.now()));
            if !gap.is_zero() {
                tokio::time::sleep(gap.div_f64(speedup)).await;
            }
            if let Some(event) = self.scheduler.step() {
                self.dispatch(event)?;
            }
        }
        Ok(())
    }

    /// Cancels every open round on every live node and discards whatever is
    /// still scheduled. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut dropped = 0;
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            let mut ctx = SimContext {
                node: NodeId(idx),
                scheduler: &mut self.scheduler,
                network: &mut self.network,
            };
            dropped += node.on_stop(&mut ctx);
        }
        let discarded = self.scheduler.drain_pending();
        tracing::info!(
            now_ms = self.now().as_millis() as u64,
            dropped,
            discarded,
            "Simulation stopped"
        );
    }

    pub fn report(&self) -> SimulationReport {
        let (root, congestion) = match self.root() {
            Some(root) => (root.stats().clone(), root.congestion_stats()),
            None => Default::default(),
        };
        SimulationReport {
            seed: self.scheduler.seed(),
            end_time_ms: self.now().as_millis() as u64,
            events_processed: self.scheduler.processed_count(),
            algorithm: self
                .root()
                .map(|r| r.controller().algorithm())
                .unwrap_or_default(),
            root,
            congestion,
            network: self.network.stats().clone(),
            completions: self.counter.counts.lock().clone(),
        }
    }
}

impl fmt::Debug for AggregationSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationSimulation")
            .field("scheduler", &self.scheduler)
            .field("nodes", &self.nodes)
            .field("stop_time", &self.stop_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::aggregation::observer::RecordingObserver;
    use crate::config::NodeSpec;

    fn config(nodes: Vec<NodeSpec>) -> Config {
        let mut config = Config {
            nodes,
            ..Default::default()
        };
        config.simulation.seed = 5;
        config
    }

    fn star() -> Config {
        config(vec![
            NodeSpec::root("root", ["a", "b", "c"]),
            NodeSpec::leaf("a", 5),
            NodeSpec::leaf("b", 5),
            NodeSpec::leaf("c", 6),
        ])
    }

    #[test_log::test]
    fn full_rounds_reach_the_root() -> TestResult {
        let mut cfg = star();
        cfg.aggregation.rounds = Some(4);
        let recorder = Arc::new(RecordingObserver::new());
        let mut sim = AggregationSimulation::new(&cfg, recorder.clone())?;
        let report = sim.run()?;

        assert_eq!(report.root.launched, 4);
        assert_eq!(report.root.completed_full, 4);
        assert_eq!(report.root.completed_partial, 0);
        assert_eq!(report.root.last_sum, Some(16));
        assert_eq!(report.root.last_confidence, Some(1.0));
        let sums: Vec<u64> = recorder
            .completions("root")
            .into_iter()
            .map(|(_, sum, _, _)| sum)
            .collect();
        assert_eq!(sums, vec![16; 4]);
        assert_eq!(report.completions["root"].full, 4);
        // Budget spent well before the stop time.
        assert!(report.end_time_ms < 1_000);
        Ok(())
    }

    #[test_log::test]
    fn crashed_leaf_yields_partial_rounds() -> TestResult {
        let mut cfg = star();
        cfg.nodes[3] = NodeSpec::leaf("c", 6).crashed();
        cfg.aggregation.rounds = Some(2);
        let recorder = Arc::new(RecordingObserver::new());
        let report = AggregationSimulation::new(&cfg, recorder.clone())?.run()?;

        assert_eq!(report.root.completed_partial, 2);
        for (_, sum, received, expected) in recorder.completions("root") {
            assert_eq!((sum, received, expected), (10, 2, 3));
        }
        assert_eq!(report.root.last_confidence, Some(2.0 / 3.0));
        assert!(report.to_string().contains("(confidence 0.67)"));
        assert!(report.network.messages_dropped >= 2);
        Ok(())
    }

    #[test]
    fn timers_map_to_scheduler_events() {
        let mut scheduler = Scheduler::new(1);
        let mut network = SimulatedNetwork::new(["x"].map(Arc::<str>::from));
        let mut ctx = SimContext {
            node: NodeId(0),
            scheduler: &mut scheduler,
            network: &mut network,
        };
        let handle = ctx.schedule_after(Duration::from_millis(5), SequenceId::new(3));
        assert!(ctx.cancel(handle));
        assert!(!ctx.cancel(handle));
        assert_eq!(ctx.next_request_id(), RequestId::new(1));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn invalid_config_is_refused() {
        let cfg = config(vec![NodeSpec::leaf("lonely", 1)]);
        let err = AggregationSimulation::new(&cfg, Arc::new(RecordingObserver::new())).unwrap_err();
        assert_eq!(err, ConfigError::NoRoot);
    }

    #[test]
    fn mid_run_crash_turns_rounds_partial() -> TestResult {
        let mut cfg = star();
        cfg.aggregation.rounds = Some(50);
        let mut sim = AggregationSimulation::new(&cfg, Arc::new(RecordingObserver::new()))?;
        sim.run_until(Duration::from_millis(100))?;
        let before = sim.root().ok_or("root")?.stats().clone();
        assert!(before.completed_full > 0);
        assert!(sim.crash("b"));
        assert!(!sim.crash("nobody"));

        sim.run_until(Duration::from_secs(60))?;
        let after = sim.root().ok_or("root")?.stats().clone();
        assert!(after.completed_partial > 0);
        assert_eq!(after.completed(), 50);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn paced_run_matches_virtual_run() -> TestResult {
        let mut cfg = star();
        cfg.aggregation.rounds = Some(3);

        let mut virtual_run = AggregationSimulation::new(&cfg, Arc::new(RecordingObserver::new()))?;
        virtual_run.run_until(cfg.simulation.stop_time())?;

        let mut paced = AggregationSimulation::new(&cfg, Arc::new(RecordingObserver::new()))?;
        let started = tokio::time::Instant::now();
        paced.run_paced(cfg.simulation.stop_time(), 1.0).await?;

        assert_eq!(paced.now(), virtual_run.now());
        assert_eq!(paced.root().ok_or("root")?.stats(), virtual_run.root().ok_or("root")?.stats());
        assert!(started.elapsed() >= paced.now());
        Ok(())
    }
}
