//! The top of the aggregation tree.
//!
//! The root originates rounds instead of answering a parent. It keeps as many
//! rounds open as the congestion window allows and feeds every outcome back
//! to the controller, so a tree that keeps timing out is driven with fewer
//! rounds in flight.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::aggregation::{
    AggregationObserver, Completion, Origin, Response, RoundResult, RoundTable, SequenceId,
    TimerHandle,
};
use crate::congestion::{
    CongestionControl, CongestionControlStats, CongestionController, PartialTimeoutPolicy,
};
use crate::simulation::{RealTime, TimeSource};

use super::context::NodeContext;
use super::engine::{Finished, RoundEngine};

/// The first sequence id a root allocates.
pub const FIRST_SEQUENCE: SequenceId = SequenceId::new(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RootError {
    #[error("root {0} has no children to aggregate from")]
    NoChildren(String),
}

/// Running counters for a root.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RootStats {
    /// Rounds admitted and fanned out.
    pub launched: u64,
    pub completed_full: u64,
    pub completed_partial: u64,
    /// Admission attempts refused by the round table.
    pub rejected: u64,
    pub last_sum: Option<u64>,
    /// Share of the root's children folded into the most recent aggregate.
    pub last_confidence: Option<f64>,
    /// Congestion window after the most recent outcome.
    pub window: usize,
}

impl RootStats {
    pub fn completed(&self) -> u64 {
        self.completed_full + self.completed_partial
    }
}

pub struct RootRole<T: TimeSource = RealTime> {
    engine: RoundEngine,
    controller: CongestionController<T>,
    policy: PartialTimeoutPolicy,
    next_sequence: Option<SequenceId>,
    /// Stop launching after this many rounds; `None` runs until stopped.
    budget: Option<u64>,
    stats: RootStats,
}

impl<T: TimeSource> RootRole<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Arc<str>,
        children: Vec<String>,
        capacity: usize,
        child_timeout: Duration,
        controller: CongestionController<T>,
        policy: PartialTimeoutPolicy,
        budget: Option<u64>,
        observer: Arc<dyn AggregationObserver>,
    ) -> Self {
        let window = controller.window();
        Self {
            engine: RoundEngine::new(name, children, capacity, child_timeout, observer),
            controller,
            policy,
            next_sequence: Some(FIRST_SEQUENCE),
            budget,
            stats: RootStats {
                window,
                ..Default::default()
            },
        }
    }

    pub fn children(&self) -> &[String] {
        self.engine.children()
    }

    pub fn rounds(&self) -> &RoundTable {
        self.engine.table()
    }

    pub fn controller(&self) -> &CongestionController<T> {
        &self.controller
    }

    pub fn congestion_stats(&self) -> CongestionControlStats {
        self.controller.stats()
    }

    pub fn policy(&self) -> PartialTimeoutPolicy {
        self.policy
    }

    pub fn stats(&self) -> &RootStats {
        &self.stats
    }

    /// True once the round budget is spent and every launched round finished.
    pub fn is_done(&self) -> bool {
        self.budget_exhausted() && self.engine.table().is_empty()
    }

    pub fn on_start(&mut self, ctx: &mut impl NodeContext) -> Result<(), RootError> {
        if self.engine.children().is_empty() {
            return Err(RootError::NoChildren(self.engine.name().to_string()));
        }
        tracing::info!(
            node = %self.engine.name(),
            algorithm = %self.controller.algorithm(),
            window = self.controller.window(),
            children = self.engine.children().len(),
            "Root started"
        );
        self.fill_window(ctx);
        Ok(())
    }

    pub fn on_response(&mut self, response: &Response, ctx: &mut impl NodeContext) {
        let Some(seq) = self.engine.fold_response(response, ctx) else {
            return;
        };
        if let Some(finished) = self.engine.finish(seq, ctx) {
            let rtt = ctx.now().saturating_sub(finished.round.started_at());
            self.controller.on_round_success_with_rtt(rtt);
            self.record(&finished);
        }
        self.fill_window(ctx);
    }

    pub fn on_timer(&mut self, seq: SequenceId, handle: TimerHandle, ctx: &mut impl NodeContext) {
        let Some(finished) = self.engine.expire(seq, handle, ctx) else {
            return;
        };
        if self.policy.is_success(finished.result.received) {
            let rtt = ctx.now().saturating_sub(finished.round.started_at());
            self.controller.on_round_success_with_rtt(rtt);
        } else {
            self.controller.on_round_timeout();
        }
        self.record(&finished);
        self.fill_window(ctx);
    }

    pub fn on_stop(&mut self, ctx: &mut impl NodeContext) -> usize {
        self.engine.shutdown(ctx)
    }

    fn record(&mut self, finished: &Finished) {
        let RoundResult { sequence, sum, .. } = finished.result;
        let completion = finished.result.completion();
        match completion {
            Completion::Full => self.stats.completed_full += 1,
            Completion::Partial => self.stats.completed_partial += 1,
        }
        let coverage = finished.result.coverage();
        self.stats.last_sum = Some(sum);
        self.stats.last_confidence = Some(coverage.ratio());
        self.stats.window = self.controller.window();
        tracing::info!(
            node = %self.engine.name(),
            seq = %sequence,
            sum,
            %coverage,
            confidence = coverage.ratio(),
            %completion,
            window = self.stats.window,
            "Round finished at root"
        );
    }

    fn budget_exhausted(&self) -> bool {
        self.next_sequence.is_none()
            || self
                .budget
                .is_some_and(|budget| self.stats.launched >= budget)
    }

    /// Opens rounds until the window is full, the budget is spent, or the
    /// round table refuses one.
    fn fill_window(&mut self, ctx: &mut impl NodeContext) {
        while self.engine.table().len() < self.controller.window() && !self.budget_exhausted() {
            let Some(seq) = self.next_sequence else {
                break;
            };
            if let Err(error) = self.engine.open_round(seq, Origin::Local, ctx) {
                self.stats.rejected += 1;
                tracing::warn!(node = %self.engine.name(), %seq, %error, "Round not admitted");
                break;
            }
            self.stats.launched += 1;
            self.next_sequence = seq.next();
        }
    }
}

impl<T: TimeSource> std::fmt::Debug for RootRole<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootRole")
            .field("name", &self.engine.name())
            .field("children", &self.engine.children())
            .field("controller", &self.controller)
            .field("policy", &self.policy)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::aggregation::observer::RecordingObserver;
    use crate::aggregation::{Coverage, Message, Request};
    use crate::congestion::{CongestionControlAlgorithm, CongestionControlConfig};
    use crate::node::context::ManualContext;
    use crate::simulation::VirtualTime;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn root(
        children: &[&str],
        config: CongestionControlConfig,
        policy: PartialTimeoutPolicy,
        budget: Option<u64>,
    ) -> RootRole<VirtualTime> {
        RootRole::new(
            "root".into(),
            children.iter().map(|c| c.to_string()).collect(),
            10,
            TIMEOUT,
            config.build_with_time_source(VirtualTime::new()),
            policy,
            budget,
            Arc::new(RecordingObserver::new()),
        )
    }

    fn aimd() -> CongestionControlConfig {
        CongestionControlConfig::new(CongestionControlAlgorithm::Aimd)
    }

    fn requests(sent: Vec<Message>) -> Vec<Request> {
        sent.into_iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn answer_all(root: &mut RootRole<VirtualTime>, ctx: &mut ManualContext, value: u64) {
        for request in requests(ctx.take_sent()) {
            root.on_response(&Response::answer(&request, value, Coverage::FULL_LEAF), ctx);
        }
    }

    #[test]
    fn refuses_to_start_without_children() {
        let mut root = root(&[], aimd(), PartialTimeoutPolicy::default(), None);
        let mut ctx = ManualContext::new();
        assert_eq!(
            root.on_start(&mut ctx),
            Err(RootError::NoChildren("root".into()))
        );
        assert!(ctx.sent().is_empty());
    }

    #[test]
    fn first_round_is_sequence_one() {
        let mut root = root(&["a", "b"], aimd(), PartialTimeoutPolicy::default(), None);
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        let names: Vec<_> = requests(ctx.take_sent())
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(names, vec!["/a/1", "/b/1"]);
        assert_eq!(root.stats().launched, 1);
    }

    #[test]
    fn successes_widen_the_window() {
        let mut root = root(&["a"], aimd(), PartialTimeoutPolicy::default(), None);
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();

        // Window 1: one round; its completion opens two more (window 2).
        answer_all(&mut root, &mut ctx, 3);
        assert_eq!(root.controller().window(), 2);
        assert_eq!(root.rounds().len(), 2);
        assert_eq!(root.stats().completed_full, 1);
        assert_eq!(root.stats().last_sum, Some(3));

        answer_all(&mut root, &mut ctx, 3);
        assert_eq!(root.controller().window(), 4);
        assert_eq!(root.rounds().len(), 4);
        assert_eq!(root.stats().launched, 7);
    }

    #[test]
    fn open_rounds_never_exceed_window() {
        let mut root = root(&["a", "b"], aimd(), PartialTimeoutPolicy::default(), None);
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        for _ in 0..5 {
            for request in requests(ctx.take_sent()) {
                root.on_response(&Response::answer(&request, 1, Coverage::FULL_LEAF), &mut ctx);
                assert!(root.rounds().len() <= root.controller().window());
            }
        }
    }

    #[test]
    fn budget_stops_launching() {
        let mut root = root(&["a"], aimd(), PartialTimeoutPolicy::default(), Some(3));
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        for _ in 0..5 {
            answer_all(&mut root, &mut ctx, 1);
        }
        assert_eq!(root.stats().launched, 3);
        assert_eq!(root.stats().completed(), 3);
        assert!(root.is_done());
    }

    #[rstest]
    #[case::progress_counts(PartialTimeoutPolicy::ProgressIsSuccess, 2)]
    #[case::any_timeout_is_loss(PartialTimeoutPolicy::AnyTimeoutIsLoss, 1)]
    fn partial_timeout_follows_policy(
        #[case] policy: PartialTimeoutPolicy,
        #[case] window_after: usize,
    ) {
        let mut root = root(&["a", "b"], aimd(), policy, Some(1));
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        let sent = requests(ctx.take_sent());
        let to_a = sent.iter().find(|r| r.name.head() == "a").unwrap();
        root.on_response(&Response::answer(to_a, 4, Coverage::FULL_LEAF), &mut ctx);

        for (handle, seq) in ctx.advance(TIMEOUT) {
            root.on_timer(seq, handle, &mut ctx);
        }
        assert_eq!(root.controller().window(), window_after);
        assert_eq!(root.stats().completed_partial, 1);
        assert_eq!(root.stats().last_sum, Some(4));
    }

    #[test]
    fn silent_timeout_is_a_loss() {
        let mut root = root(&["a"], aimd(), PartialTimeoutPolicy::ProgressIsSuccess, None);
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        answer_all(&mut root, &mut ctx, 1);
        assert_eq!(root.controller().window(), 2);

        for (handle, seq) in ctx.advance(TIMEOUT) {
            root.on_timer(seq, handle, &mut ctx);
        }
        assert_eq!(root.controller().window(), 1);
        assert_eq!(root.stats().completed_partial, 2);
        assert_eq!(root.stats().last_sum, Some(0));
        // The window still admits one replacement round.
        assert_eq!(root.rounds().len(), 1);
    }

    #[test]
    fn capacity_rejection_stops_the_fill() {
        let config = aimd().with_initial_window(20);
        let mut root = root(&["a"], config, PartialTimeoutPolicy::default(), None);
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        assert_eq!(root.rounds().len(), 10);
        assert_eq!(root.stats().launched, 10);
        assert_eq!(root.stats().rejected, 1);
    }

    #[test]
    fn rtt_reaches_the_controller() {
        let config = CongestionControlConfig::new(CongestionControlAlgorithm::Bbr);
        let mut root = root(&["a"], config, PartialTimeoutPolicy::default(), None);
        let mut ctx = ManualContext::new();
        root.on_start(&mut ctx).unwrap();
        ctx.advance(Duration::from_millis(250));
        answer_all(&mut root, &mut ctx, 1);
        assert_eq!(
            root.congestion_stats().min_rtt,
            Some(Duration::from_millis(250))
        );
    }
}
