use std::collections::BTreeMap;
use std::time::Duration;

use super::errors::AdmissionError;
use super::round::{Origin, Round};
use super::timer::TimerService;
use super::SequenceId;

/// Capacity-bounded registry of a node's open rounds.
///
/// Each admitted round owns the handle of its straggler timer. Removing a
/// round releases that handle through exactly one cancellation call, whether
/// the round completed or timed out.
#[derive(Debug)]
pub struct RoundTable {
    capacity: usize,
    rounds: BTreeMap<SequenceId, Round>,
}

impl RoundTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rounds: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn contains(&self, seq: SequenceId) -> bool {
        self.rounds.contains_key(&seq)
    }

    /// Open sequence ids in ascending order.
    pub fn sequences(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.rounds.keys().copied()
    }

    /// Admits a new round and arms its straggler timer.
    ///
    /// Duplicates are checked before capacity so that a re-delivered request
    /// is always reported as such.
    pub fn insert(
        &mut self,
        seq: SequenceId,
        expected: u32,
        origin: Origin,
        timeout: Duration,
        timers: &mut impl TimerService,
    ) -> Result<(), AdmissionError> {
        if self.rounds.contains_key(&seq) {
            return Err(AdmissionError::Duplicate(seq));
        }
        if self.rounds.len() >= self.capacity {
            return Err(AdmissionError::AtCapacity {
                capacity: self.capacity,
            });
        }
        let mut round = Round::new(seq, expected, origin, timers.now());
        round.set_timer(timers.schedule_after(timeout, seq));
        self.rounds.insert(seq, round);
        Ok(())
    }

    pub fn get(&self, seq: SequenceId) -> Option<&Round> {
        self.rounds.get(&seq)
    }

    pub fn get_mut(&mut self, seq: SequenceId) -> Option<&mut Round> {
        self.rounds.get_mut(&seq)
    }

    /// Erases a round, cancelling its timer.
    pub fn remove(&mut self, seq: SequenceId, timers: &mut impl TimerService) -> Option<Round> {
        let Some(mut round) = self.rounds.remove(&seq) else {
            tracing::debug!(%seq, "Remove of unknown round ignored");
            return None;
        };
        if !round.is_replied() {
            tracing::warn!(%seq, "Removing a round that never replied");
        }
        if let Some(handle) = round.take_timer() {
            timers.cancel(handle);
        }
        Some(round)
    }

    /// Drops every open round and cancels their timers.
    pub fn clear(&mut self, timers: &mut impl TimerService) -> usize {
        let count = self.rounds.len();
        for (_, mut round) in std::mem::take(&mut self.rounds) {
            if let Some(handle) = round.take_timer() {
                timers.cancel(handle);
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::aggregation::TimerHandle;

    #[derive(Default)]
    struct FakeTimers {
        now: Duration,
        next: u64,
        pending: BTreeSet<TimerHandle>,
        cancels: Vec<TimerHandle>,
    }

    impl TimerService for FakeTimers {
        fn now(&self) -> Duration {
            self.now
        }

        fn schedule_after(&mut self, _delay: Duration, _seq: SequenceId) -> TimerHandle {
            self.next += 1;
            let handle = TimerHandle::new(self.next);
            self.pending.insert(handle);
            handle
        }

        fn cancel(&mut self, handle: TimerHandle) -> bool {
            self.cancels.push(handle);
            self.pending.remove(&handle)
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn seq(n: u64) -> SequenceId {
        SequenceId::new(n)
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut timers = FakeTimers::default();
        let mut table = RoundTable::new(10);

        table
            .insert(seq(5), 3, Origin::Local, TIMEOUT, &mut timers)
            .unwrap();
        assert_eq!(
            table.insert(seq(5), 3, Origin::Local, TIMEOUT, &mut timers),
            Err(AdmissionError::Duplicate(seq(5)))
        );
        assert_eq!(table.len(), 1);
        assert_eq!(timers.pending.len(), 1);
    }

    #[test]
    fn capacity_rejects_until_a_slot_is_freed() {
        let mut timers = FakeTimers::default();
        let mut table = RoundTable::new(2);

        table.insert(seq(1), 1, Origin::Local, TIMEOUT, &mut timers).unwrap();
        table.insert(seq(2), 1, Origin::Local, TIMEOUT, &mut timers).unwrap();
        for _ in 0..3 {
            assert_eq!(
                table.insert(seq(3), 1, Origin::Local, TIMEOUT, &mut timers),
                Err(AdmissionError::AtCapacity { capacity: 2 })
            );
        }

        table.get_mut(seq(1)).unwrap().finalize().unwrap();
        table.remove(seq(1), &mut timers).unwrap();
        table.insert(seq(3), 1, Origin::Local, TIMEOUT, &mut timers).unwrap();
        assert_eq!(table.sequences().collect::<Vec<_>>(), vec![seq(2), seq(3)]);
    }

    #[test]
    fn remove_cancels_timer_once() {
        let mut timers = FakeTimers {
            now: Duration::from_millis(250),
            ..Default::default()
        };
        let mut table = RoundTable::new(4);
        table.insert(seq(9), 2, Origin::Local, TIMEOUT, &mut timers).unwrap();
        let handle = table.get(seq(9)).and_then(Round::timer).unwrap();
        assert_eq!(table.get(seq(9)).unwrap().started_at(), Duration::from_millis(250));

        table.get_mut(seq(9)).unwrap().finalize().unwrap();
        let removed = table.remove(seq(9), &mut timers).unwrap();
        assert!(removed.timer().is_none());
        assert_eq!(timers.cancels, vec![handle]);
        assert!(timers.pending.is_empty());

        assert!(table.remove(seq(9), &mut timers).is_none());
        assert_eq!(timers.cancels.len(), 1);
    }

    #[test]
    fn clear_cancels_every_timer() {
        let mut timers = FakeTimers::default();
        let mut table = RoundTable::new(4);
        for n in 1..=3 {
            table.insert(seq(n), 1, Origin::Local, TIMEOUT, &mut timers).unwrap();
        }
        assert_eq!(table.clear(&mut timers), 3);
        assert!(table.is_empty());
        assert!(timers.pending.is_empty());
        assert!(!table.contains(seq(2)));
    }
}
