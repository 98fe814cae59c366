//! Deterministic event scheduler for simulation.
//!
//! The scheduler processes events in a deterministic order based on:
//! 1. Event timestamp (earlier first)
//! 2. Target node (for same timestamp)
//! 3. Event ID, i.e. registration order (complete tie-breaking)

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    fmt,
    time::Duration,
};

use crate::aggregation::{Message, SequenceId};

use super::{
    rng::SimulationRng,
    time::{TimeSource, VirtualTime},
};

/// Index of a node in the simulated topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// Start a node's role.
    Start { node: NodeId },
    /// A message arriving at `to`.
    Deliver {
        from: NodeId,
        to: NodeId,
        message: Message,
    },
    /// A straggler timer set by `node` for round `seq`.
    Timer { node: NodeId, seq: SequenceId },
}

impl EventType {
    /// The node that handles this event (for ordering).
    pub fn target(&self) -> NodeId {
        match self {
            EventType::Start { node } => *node,
            EventType::Deliver { to, .. } => *to,
            EventType::Timer { node, .. } => *node,
        }
    }
}

/// A scheduled event in the simulation.
#[derive(Debug, Clone)]
pub struct Event {
    /// When this event should be processed (virtual nanos)
    pub timestamp: u64,
    pub id: EventId,
    pub event_type: EventType,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reversed so the earliest event pops first.
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.event_type.target().cmp(&self.event_type.target()))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Deterministic event scheduler for simulation.
///
/// Processes events in timestamp order with deterministic tie-breaking.
/// All randomness goes through the seeded RNG.
pub struct Scheduler {
    time: VirtualTime,
    rng: SimulationRng,
    pending_events: BinaryHeap<Event>,
    /// Ids still due to fire; a cancelled event stays in the heap but is
    /// skipped when popped.
    live: HashSet<EventId>,
    next_event_id: u64,
    processed: u64,
}

impl Scheduler {
    pub fn new(seed: u64) -> Self {
        Self {
            time: VirtualTime::new(),
            rng: SimulationRng::new(seed),
            pending_events: BinaryHeap::new(),
            live: HashSet::new(),
            next_event_id: 0,
            processed: 0,
        }
    }

    pub fn time(&self) -> &VirtualTime {
        &self.time
    }

    /// Current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.time.now_nanos()
    }

    pub fn rng(&self) -> &SimulationRng {
        &self.rng
    }

    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    pub fn pending_count(&self) -> usize {
        self.live.len()
    }

    /// Events handed out by [`Scheduler::step`] so far.
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Schedules an event at the given absolute timestamp. Timestamps in the
    /// past are processed at the current time.
    pub fn schedule_at(&mut self, timestamp: u64, event_type: EventType) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending_events.push(Event {
            timestamp: timestamp.max(self.now()),
            id,
            event_type,
        });
        self.live.insert(id);
        id
    }

    pub fn schedule_after(&mut self, delay: Duration, event_type: EventType) -> EventId {
        let delay = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let timestamp = self.now().saturating_add(delay);
        self.schedule_at(timestamp, event_type)
    }

    /// Cancels a pending event. Returns `true` only the first time for an
    /// event that has not fired yet.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.live.remove(&id)
    }

    /// Timestamp of the next event that will actually fire.
    pub fn next_event_time(&mut self) -> Option<u64> {
        self.discard_cancelled();
        self.pending_events.peek().map(|e| e.timestamp)
    }

    fn discard_cancelled(&mut self) {
        while let Some(event) = self.pending_events.peek() {
            if self.live.contains(&event.id) {
                break;
            }
            self.pending_events.pop();
        }
    }

    /// Processes the next pending event, advancing time to it.
    pub fn step(&mut self) -> Option<Event> {
        self.discard_cancelled();
        let event = self.pending_events.pop()?;
        self.live.remove(&event.id);
        self.time.advance_to(event.timestamp);
        self.processed += 1;
        tracing::trace!(
            timestamp = event.timestamp,
            id = event.id.0,
            target = %event.event_type.target(),
            "Processing event"
        );
        Some(event)
    }

    /// Pops the next event if it is due at or before `target_time`.
    /// Otherwise advances the clock to `target_time` and returns `None`.
    pub fn step_until(&mut self, target_time: u64) -> Option<Event> {
        match self.next_event_time() {
            Some(next) if next <= target_time => self.step(),
            _ => {
                self.time.advance_to(target_time);
                None
            }
        }
    }

    /// Drops every pending event without processing it.
    pub fn drain_pending(&mut self) -> usize {
        let drained = self.live.len();
        self.pending_events.clear();
        self.live.clear();
        drained
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now())
            .field("seed", &self.rng.seed())
            .field("pending_count", &self.pending_count())
            .field("processed", &self.processed)
            .finish()
    }
}
