use std::sync::Arc;
use std::time::Duration;

use crate::aggregation::{
    AdmissionError, AggregationEvent, AggregationObserver, Coverage, DropReason, FoldError,
    Message, ObservedEvent, Origin, Request, RequestName, Response, Round, RoundResult,
    RoundTable, SequenceId, TimerHandle,
};

use super::context::NodeContext;

/// A finalized round, already removed from the table.
#[derive(Debug)]
pub(crate) struct Finished {
    pub result: RoundResult,
    pub round: Round,
}

impl Finished {
    /// Answers the parent request this round was opened for, if any.
    pub fn reply(&self, ctx: &mut impl NodeContext) {
        if let Origin::Parent { request, name } = self.round.origin() {
            let response = Response::answer(
                &Request::new(*request, name.clone()),
                self.result.sum,
                self.result.coverage(),
            );
            ctx.send(Message::Response(response));
        }
    }
}

/// Fan-out/fan-in machinery shared by the root and aggregator roles.
pub(crate) struct RoundEngine {
    name: Arc<str>,
    children: Vec<String>,
    table: RoundTable,
    child_timeout: Duration,
    observer: Arc<dyn AggregationObserver>,
}

impl RoundEngine {
    pub fn new(
        name: Arc<str>,
        children: Vec<String>,
        capacity: usize,
        child_timeout: Duration,
        observer: Arc<dyn AggregationObserver>,
    ) -> Self {
        Self {
            name,
            children,
            table: RoundTable::new(capacity),
            child_timeout,
            observer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn table(&self) -> &RoundTable {
        &self.table
    }

    fn emit(&self, at: Duration, event: AggregationEvent) {
        self.observer.on_event(&ObservedEvent {
            at,
            node: self.name.clone(),
            event,
        });
    }

    /// Admits a round sized to the child set and sends one request per child.
    pub fn open_round(
        &mut self,
        seq: SequenceId,
        origin: Origin,
        ctx: &mut impl NodeContext,
    ) -> Result<(), AdmissionError> {
        let admitted = expected_contributors(self.children.len()).and_then(|expected| {
            self.table
                .insert(seq, expected, origin, self.child_timeout, ctx)
                .map(|()| expected)
        });
        let expected = match admitted {
            Ok(expected) => expected,
            Err(reason) => {
                self.emit(ctx.now(), AggregationEvent::RoundRejected { seq, reason });
                return Err(reason);
            }
        };
        self.emit(ctx.now(), AggregationEvent::RoundStarted { seq, expected });
        for child in &self.children {
            let request = Request::new(ctx.next_request_id(), RequestName::for_child(child, seq));
            ctx.send(Message::Request(request));
        }
        Ok(())
    }

    /// Folds a child response. Returns the sequence id once its round holds
    /// every expected contribution.
    pub fn fold_response(
        &mut self,
        response: &Response,
        ctx: &mut impl NodeContext,
    ) -> Option<SequenceId> {
        let child = response.name.head();
        let seq = match response.sequence() {
            Ok(seq) => seq,
            Err(_) => {
                self.orphan(None, child, DropReason::MalformedName, &*ctx);
                return None;
            }
        };
        let Some(index) = self.children.iter().position(|c| c == child) else {
            self.orphan(Some(seq), child, DropReason::UnknownChild, &*ctx);
            return None;
        };
        let Some(round) = self.table.get_mut(seq) else {
            self.orphan(Some(seq), child, DropReason::UnknownRound, &*ctx);
            return None;
        };
        if round.is_replied() {
            self.orphan(Some(seq), child, DropReason::AlreadyReplied, &*ctx);
            return None;
        }
        let value = match response.value() {
            Ok(v) => v,
            Err(error) => {
                tracing::debug!(node = %self.name, %seq, %error, "Undecodable payload");
                self.orphan(Some(seq), child, DropReason::BadPayload, &*ctx);
                return None;
            }
        };
        if let Err(error) = round.fold_from(index, value) {
            let reason = match error {
                FoldError::AlreadyReplied => DropReason::AlreadyReplied,
                FoldError::Saturated { .. } => DropReason::RoundFull,
                FoldError::DuplicateContributor(_) => DropReason::DuplicateChild,
                FoldError::Overflow => DropReason::Overflow,
            };
            self.orphan(Some(seq), child, reason, &*ctx);
            return None;
        }
        let complete = round.is_complete();
        self.emit(
            ctx.now(),
            AggregationEvent::ContributionReceived {
                seq,
                child: child.to_string(),
                value,
            },
        );
        complete.then_some(seq)
    }

    fn orphan(
        &self,
        seq: Option<SequenceId>,
        child: &str,
        reason: DropReason,
        ctx: &impl NodeContext,
    ) {
        self.emit(
            ctx.now(),
            AggregationEvent::OrphanResponse {
                seq,
                child: child.to_string(),
                reason,
            },
        );
    }

    /// Finalizes and removes `seq`; `None` if it is gone or already replied.
    pub fn finish(&mut self, seq: SequenceId, ctx: &mut impl NodeContext) -> Option<Finished> {
        let round = self.table.get_mut(seq)?;
        let result = round.finalize().ok()?;
        let round = self.table.remove(seq, ctx)?;
        self.emit(
            ctx.now(),
            AggregationEvent::RoundCompleted {
                seq,
                sum: result.sum,
                expected: result.expected,
                received: result.received,
                completion: result.completion(),
            },
        );
        Some(Finished { result, round })
    }

    /// Handles a straggler timer. Stale timers (round gone, replied, or
    /// re-opened under a newer timer) are ignored.
    pub fn expire(
        &mut self,
        seq: SequenceId,
        handle: TimerHandle,
        ctx: &mut impl NodeContext,
    ) -> Option<Finished> {
        let Some(round) = self.table.get(seq) else {
            tracing::debug!(node = %self.name, %seq, "Timer for finished round ignored");
            return None;
        };
        if round.is_replied() || round.timer() != Some(handle) {
            tracing::debug!(node = %self.name, %seq, "Stale timer ignored");
            return None;
        }
        let coverage = Coverage::new(round.received(), round.expected());
        tracing::debug!(node = %self.name, %seq, %coverage, "Straggler timeout");
        self.finish(seq, ctx)
    }

    /// Cancels every open round without replying.
    pub fn shutdown(&mut self, ctx: &mut impl NodeContext) -> usize {
        self.table.clear(ctx)
    }
}

/// Contributor count for a round fanned out to `children` children.
fn expected_contributors(children: usize) -> Result<u32, AdmissionError> {
    u32::try_from(children).map_err(|_| AdmissionError::TooManyChildren { children })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contributor_count_is_checked() {
        assert_eq!(expected_contributors(0), Ok(0));
        assert_eq!(expected_contributors(3), Ok(3));
        assert_eq!(expected_contributors(u32::MAX as usize), Ok(u32::MAX));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_fan_out_is_rejected() {
        let children = u32::MAX as usize + 1;
        assert_eq!(
            expected_contributors(children),
            Err(AdmissionError::TooManyChildren { children })
        );
    }
}
