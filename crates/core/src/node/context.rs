//! Host-side interfaces a node runs against.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::aggregation::{Message, RequestId, SequenceId, TimerHandle, TimerService};

/// Delivers messages on behalf of a node.
///
/// Requests are routed by the first component of their name; responses go
/// back to whoever issued the request with the same [`RequestId`].
pub trait Transport {
    fn send(&mut self, message: Message);

    /// A request id not used by any other outstanding request.
    fn next_request_id(&mut self) -> RequestId;
}

/// Everything a role needs from its host while handling one event.
pub trait NodeContext: TimerService + Transport {}

impl<T: TimerService + Transport + ?Sized> NodeContext for T {}

/// A hand-driven context: time only moves through [`ManualContext::advance`]
/// and sent messages are collected instead of delivered.
#[derive(Debug, Default)]
pub struct ManualContext {
    now: Duration,
    next_timer: u64,
    next_request: u64,
    timers: BTreeMap<TimerHandle, (Duration, SequenceId)>,
    sent: Vec<Message>,
}

impl ManualContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward and returns the timers that came due, earliest
    /// first. Fired timers are no longer pending.
    pub fn advance(&mut self, by: Duration) -> Vec<(TimerHandle, SequenceId)> {
        self.now += by;
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= self.now)
            .map(|(handle, (deadline, seq))| (*deadline, *handle, *seq))
            .collect();
        due.sort();
        due.into_iter()
            .map(|(_, handle, seq)| {
                self.timers.remove(&handle);
                (handle, seq)
            })
            .collect()
    }

    pub fn take_sent(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.sent)
    }

    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

impl TimerService for ManualContext {
    fn now(&self) -> Duration {
        self.now
    }

    fn schedule_after(&mut self, delay: Duration, seq: SequenceId) -> TimerHandle {
        self.next_timer += 1;
        let handle = TimerHandle::new(self.next_timer);
        self.timers.insert(handle, (self.now + delay, seq));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.remove(&handle).is_some()
    }
}

impl Transport for ManualContext {
    fn send(&mut self, message: Message) {
        self.sent.push(message);
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId::new(self.next_request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut ctx = ManualContext::new();
        let late = ctx.schedule_after(Duration::from_millis(300), SequenceId::new(1));
        let early = ctx.schedule_after(Duration::from_millis(100), SequenceId::new(2));
        let cancelled = ctx.schedule_after(Duration::from_millis(200), SequenceId::new(3));
        assert!(ctx.cancel(cancelled));
        assert!(!ctx.cancel(cancelled));

        assert!(ctx.advance(Duration::from_millis(50)).is_empty());
        let fired = ctx.advance(Duration::from_millis(300));
        assert_eq!(
            fired,
            vec![(early, SequenceId::new(2)), (late, SequenceId::new(1))]
        );
        assert_eq!(ctx.pending_timers(), 0);
        assert!(!ctx.cancel(late));
    }
}
