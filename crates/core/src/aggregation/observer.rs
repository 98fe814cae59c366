//! Observability hooks for the round state machine.
//!
//! Roles receive an [`AggregationObserver`] handle at construction and report
//! every state transition through it. The handle is scoped to the node that
//! owns it; several observers can be combined with [`FanoutObserver`].

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::errors::AdmissionError;
use super::message::Coverage;
use super::round::Completion;
use super::SequenceId;

/// Why an inbound response was dropped without touching any round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownRound,
    AlreadyReplied,
    UnknownChild,
    DuplicateChild,
    RoundFull,
    MalformedName,
    BadPayload,
    Overflow,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::UnknownRound => "unknown-round",
            DropReason::AlreadyReplied => "already-replied",
            DropReason::UnknownChild => "unknown-child",
            DropReason::DuplicateChild => "duplicate-child",
            DropReason::RoundFull => "round-full",
            DropReason::MalformedName => "malformed-name",
            DropReason::BadPayload => "bad-payload",
            DropReason::Overflow => "overflow",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationEvent {
    /// A round was admitted and its child requests sent.
    RoundStarted { seq: SequenceId, expected: u32 },
    ContributionReceived {
        seq: SequenceId,
        child: String,
        value: u64,
    },
    RoundCompleted {
        seq: SequenceId,
        sum: u64,
        expected: u32,
        received: u32,
        completion: Completion,
    },
    RoundRejected {
        seq: SequenceId,
        reason: AdmissionError,
    },
    OrphanResponse {
        seq: Option<SequenceId>,
        child: String,
        reason: DropReason,
    },
}

impl AggregationEvent {
    /// Short event label, also used as the CSV `Event` column.
    pub fn label(&self) -> &'static str {
        match self {
            AggregationEvent::RoundStarted { .. } => "InterestSent",
            AggregationEvent::ContributionReceived { .. } => "DataReceived",
            AggregationEvent::RoundCompleted {
                completion: Completion::Full,
                ..
            } => "AggregateComplete",
            AggregationEvent::RoundCompleted {
                completion: Completion::Partial,
                ..
            } => "AggregatePartial",
            AggregationEvent::RoundRejected { .. } => "RoundRejected",
            AggregationEvent::OrphanResponse { .. } => "OrphanResponse",
        }
    }

    pub fn sequence(&self) -> Option<SequenceId> {
        match self {
            AggregationEvent::RoundStarted { seq, .. }
            | AggregationEvent::ContributionReceived { seq, .. }
            | AggregationEvent::RoundCompleted { seq, .. }
            | AggregationEvent::RoundRejected { seq, .. } => Some(*seq),
            AggregationEvent::OrphanResponse { seq, .. } => *seq,
        }
    }
}

/// An event stamped with the emitting node and the time it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub at: Duration,
    pub node: Arc<str>,
    pub event: AggregationEvent,
}

pub trait AggregationObserver: Send + Sync {
    fn on_event(&self, event: &ObservedEvent);
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AggregationObserver for TracingObserver {
    fn on_event(&self, ev: &ObservedEvent) {
        let node = &*ev.node;
        let at_ms = ev.at.as_millis() as u64;
        match &ev.event {
            AggregationEvent::RoundStarted { seq, expected } => {
                tracing::debug!(node, at_ms, %seq, expected, "Round started");
            }
            AggregationEvent::ContributionReceived { seq, child, value } => {
                tracing::trace!(node, at_ms, %seq, child = %child, value, "Contribution received");
            }
            AggregationEvent::RoundCompleted {
                seq,
                sum,
                expected,
                received,
                completion,
            } => {
                let confidence = Coverage::new(*received, *expected).ratio();
                tracing::info!(
                    node,
                    at_ms,
                    %seq,
                    sum,
                    expected,
                    received,
                    confidence,
                    %completion,
                    "Round completed"
                );
            }
            AggregationEvent::RoundRejected { seq, reason } => {
                tracing::warn!(node, at_ms, %seq, %reason, "Round rejected");
            }
            AggregationEvent::OrphanResponse { seq, child, reason } => {
                tracing::warn!(node, at_ms, ?seq, child = %child, %reason, "Dropping response");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Completed rounds reported by `node`, in emission order.
    pub fn completions(&self, node: &str) -> Vec<(SequenceId, u64, u32, u32)> {
        self.events
            .lock()
            .iter()
            .filter(|e| &*e.node == node)
            .filter_map(|e| match e.event {
                AggregationEvent::RoundCompleted {
                    seq,
                    sum,
                    expected,
                    received,
                    ..
                } => Some((seq, sum, received, expected)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&AggregationEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(&e.event)).count()
    }
}

impl AggregationObserver for RecordingObserver {
    fn on_event(&self, event: &ObservedEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Writes events as CSV rows:
/// `Time(s),Event,Node,Seq,Child,Expected,Received,Result`.
///
/// Write failures are logged once and further rows are discarded.
pub struct CsvTraceObserver<W: Write + Send> {
    inner: Mutex<CsvSink<W>>,
}

struct CsvSink<W> {
    writer: W,
    failed: bool,
}

pub const CSV_HEADER: &str = "Time(s),Event,Node,Seq,Child,Expected,Received,Result";

impl<W: Write + Send> CsvTraceObserver<W> {
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writeln!(writer, "{CSV_HEADER}")?;
        Ok(Self {
            inner: Mutex::new(CsvSink {
                writer,
                failed: false,
            }),
        })
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.inner.lock().writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner().writer
    }

    fn row(ev: &ObservedEvent) -> String {
        let time = format!("{:.3}", ev.at.as_secs_f64());
        let seq = ev
            .event
            .sequence()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let (child, expected, received, result) = match &ev.event {
            AggregationEvent::RoundStarted { expected, .. } => {
                (String::new(), expected.to_string(), String::new(), String::new())
            }
            AggregationEvent::ContributionReceived { child, value, .. } => {
                (child.clone(), String::new(), String::new(), value.to_string())
            }
            AggregationEvent::RoundCompleted {
                sum,
                expected,
                received,
                ..
            } => (
                String::new(),
                expected.to_string(),
                received.to_string(),
                sum.to_string(),
            ),
            AggregationEvent::RoundRejected { reason, .. } => {
                (String::new(), String::new(), String::new(), reason.to_string())
            }
            AggregationEvent::OrphanResponse { child, reason, .. } => {
                (child.clone(), String::new(), String::new(), reason.to_string())
            }
        };
        format!(
            "{time},{},{},{seq},{child},{expected},{received},{result}",
            ev.event.label(),
            ev.node
        )
    }
}

impl<W: Write + Send> AggregationObserver for CsvTraceObserver<W> {
    fn on_event(&self, event: &ObservedEvent) {
        let line = Self::row(event);
        let mut sink = self.inner.lock();
        if sink.failed {
            return;
        }
        if let Err(error) = writeln!(sink.writer, "{line}") {
            tracing::warn!(%error, "Trace file write failed, disabling CSV trace");
            sink.failed = true;
        }
    }
}

impl<W: Write + Send> fmt::Debug for CsvTraceObserver<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsvTraceObserver").finish_non_exhaustive()
    }
}

/// Broadcasts each event to every wrapped observer.
#[derive(Default, Clone)]
pub struct FanoutObserver {
    observers: Vec<Arc<dyn AggregationObserver>>,
}

impl FanoutObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn AggregationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn AggregationObserver>) {
        self.observers.push(observer);
    }
}

impl AggregationObserver for FanoutObserver {
    fn on_event(&self, event: &ObservedEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(event: AggregationEvent) -> ObservedEvent {
        ObservedEvent {
            at: Duration::from_millis(1500),
            node: Arc::from("agg1"),
            event,
        }
    }

    #[test]
    fn csv_rows_follow_trace_layout() {
        let csv = CsvTraceObserver::new(Vec::new()).unwrap();
        csv.on_event(&observed(AggregationEvent::RoundStarted {
            seq: SequenceId::new(4),
            expected: 3,
        }));
        csv.on_event(&observed(AggregationEvent::ContributionReceived {
            seq: SequenceId::new(4),
            child: "leaf1".into(),
            value: 9,
        }));
        csv.on_event(&observed(AggregationEvent::RoundCompleted {
            seq: SequenceId::new(4),
            sum: 7,
            expected: 3,
            received: 2,
            completion: Completion::Partial,
        }));

        let text = String::from_utf8(csv.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1], "1.500,InterestSent,agg1,4,,3,,");
        assert_eq!(lines[2], "1.500,DataReceived,agg1,4,leaf1,,,9");
        assert_eq!(lines[3], "1.500,AggregatePartial,agg1,4,,3,2,7");
    }

    #[test]
    fn fanout_reaches_every_observer() {
        let a = Arc::new(RecordingObserver::new());
        let b = Arc::new(RecordingObserver::new());
        let fanout = FanoutObserver::new().with(a.clone()).with(b.clone());
        fanout.on_event(&observed(AggregationEvent::RoundRejected {
            seq: SequenceId::new(1),
            reason: AdmissionError::AtCapacity { capacity: 1 },
        }));
        assert_eq!(a.len(), 1);
        assert_eq!(b.events(), a.events());
    }

    #[test]
    fn recording_observer_extracts_completions() {
        let rec = RecordingObserver::new();
        rec.on_event(&observed(AggregationEvent::RoundCompleted {
            seq: SequenceId::new(2),
            sum: 16,
            expected: 3,
            received: 3,
            completion: Completion::Full,
        }));
        assert_eq!(rec.completions("agg1"), vec![(SequenceId::new(2), 16, 3, 3)]);
        assert!(rec.completions("root").is_empty());
    }
}
