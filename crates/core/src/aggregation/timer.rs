//! Timer service consumed by the round table.

use std::time::Duration;

use super::SequenceId;

/// Handle to a scheduled straggler timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Abstraction over the host scheduler.
///
/// A timer scheduled for `seq` is delivered back to the node that scheduled it
/// as a timeout for that sequence. `cancel` must tolerate handles that already
/// fired or were already cancelled.
pub trait TimerService {
    /// Current time since the scheduler's epoch.
    fn now(&self) -> Duration;

    fn schedule_after(&mut self, delay: Duration, seq: SequenceId) -> TimerHandle;

    /// Returns `true` if a pending timer was removed.
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}
