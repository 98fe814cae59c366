use std::sync::Arc;
use std::time::Duration;

use crate::aggregation::{
    AggregationObserver, Origin, Request, Response, RoundTable, SequenceId, TimerHandle,
};

use super::context::NodeContext;
use super::engine::RoundEngine;

/// An intermediate tier: fans a parent request out to its children, sums
/// their answers and replies upstream once, either when every child answered
/// or when the straggler timer fires.
pub struct AggregatorRole {
    engine: RoundEngine,
}

impl AggregatorRole {
    pub fn new(
        name: Arc<str>,
        children: Vec<String>,
        capacity: usize,
        child_timeout: Duration,
        observer: Arc<dyn AggregationObserver>,
    ) -> Self {
        Self {
            engine: RoundEngine::new(name, children, capacity, child_timeout, observer),
        }
    }

    pub fn children(&self) -> &[String] {
        self.engine.children()
    }

    pub fn rounds(&self) -> &RoundTable {
        self.engine.table()
    }

    pub fn on_request(&mut self, request: Request, ctx: &mut impl NodeContext) {
        let seq = match request.sequence() {
            Ok(seq) => seq,
            Err(error) => {
                tracing::warn!(
                    node = %self.engine.name(),
                    name = %request.name,
                    %error,
                    "Discarding request with malformed sequence"
                );
                return;
            }
        };
        if let Err(error) = self.engine.open_round(seq, Origin::parent(&request), ctx) {
            tracing::warn!(node = %self.engine.name(), %seq, %error, "Request dropped");
            return;
        }
        if self.engine.children().is_empty() {
            // Nothing to wait for: answer with an empty aggregate.
            self.complete(seq, ctx);
        }
    }

    pub fn on_response(&mut self, response: &Response, ctx: &mut impl NodeContext) {
        if let Some(seq) = self.engine.fold_response(response, ctx) {
            self.complete(seq, ctx);
        }
    }

    /// Replies with whatever has arrived so far, even if nothing did.
    pub fn on_timer(&mut self, seq: SequenceId, handle: TimerHandle, ctx: &mut impl NodeContext) {
        if let Some(finished) = self.engine.expire(seq, handle, ctx) {
            finished.reply(ctx);
        }
    }

    pub fn on_stop(&mut self, ctx: &mut impl NodeContext) -> usize {
        self.engine.shutdown(ctx)
    }

    fn complete(&mut self, seq: SequenceId, ctx: &mut impl NodeContext) {
        if let Some(finished) = self.engine.finish(seq, ctx) {
            finished.reply(ctx);
        }
    }
}

impl std::fmt::Debug for AggregatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorRole")
            .field("name", &self.engine.name())
            .field("children", &self.engine.children())
            .field("open_rounds", &self.engine.table().len())
            .finish()
    }
}
