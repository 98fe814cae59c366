//! State of one in-flight aggregation round at one node.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{FinalizeError, FoldError};
use super::message::{Coverage, Request, RequestId};
use super::name::RequestName;
use super::timer::TimerHandle;
use super::SequenceId;

/// Who the result of a round is owed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// The round answers a request issued by a parent tier.
    Parent { request: RequestId, name: RequestName },
    /// The round was started by this node (root).
    Local,
}

impl Origin {
    pub fn parent(request: &Request) -> Self {
        Origin::Parent {
            request: request.id,
            name: request.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completion {
    /// Every expected contributor answered.
    Full,
    /// The straggler timer fired first.
    Partial,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Full => write!(f, "full"),
            Completion::Partial => write!(f, "partial"),
        }
    }
}

/// Snapshot produced when a round is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub sequence: SequenceId,
    pub sum: u64,
    pub received: u32,
    pub expected: u32,
}

impl RoundResult {
    pub fn coverage(&self) -> Coverage {
        Coverage::new(self.received, self.expected)
    }

    pub fn completion(&self) -> Completion {
        if self.coverage().is_full() {
            Completion::Full
        } else {
            Completion::Partial
        }
    }
}

#[derive(Debug)]
pub struct Round {
    sequence: SequenceId,
    expected: u32,
    received: u32,
    accumulator: u64,
    replied: bool,
    origin: Origin,
    timer: Option<TimerHandle>,
    started_at: Duration,
    contributors: BTreeSet<usize>,
}

impl Round {
    pub fn new(sequence: SequenceId, expected: u32, origin: Origin, started_at: Duration) -> Self {
        Self {
            sequence,
            expected,
            received: 0,
            accumulator: 0,
            replied: false,
            origin,
            timer: None,
            started_at,
            contributors: BTreeSet::new(),
        }
    }

    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn accumulator(&self) -> u64 {
        self.accumulator
    }

    pub fn is_replied(&self) -> bool {
        self.replied
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    pub(crate) fn set_timer(&mut self, handle: TimerHandle) {
        self.timer = Some(handle);
    }

    /// Releases the timer handle; yields it at most once.
    pub(crate) fn take_timer(&mut self) -> Option<TimerHandle> {
        self.timer.take()
    }

    /// Folds an anonymous contribution.
    pub fn fold(&mut self, value: u64) -> Result<(), FoldError> {
        let sum = self.check_fold(value)?;
        self.commit(sum);
        Ok(())
    }

    /// Folds the contribution of child `contributor`, refusing a second
    /// answer from the same child.
    pub fn fold_from(&mut self, contributor: usize, value: u64) -> Result<(), FoldError> {
        let sum = self.check_fold(value)?;
        if !self.contributors.insert(contributor) {
            return Err(FoldError::DuplicateContributor(contributor));
        }
        self.commit(sum);
        Ok(())
    }

    fn check_fold(&self, value: u64) -> Result<u64, FoldError> {
        if self.replied {
            return Err(FoldError::AlreadyReplied);
        }
        if self.received >= self.expected {
            return Err(FoldError::Saturated {
                expected: self.expected,
            });
        }
        self.accumulator
            .checked_add(value)
            .ok_or(FoldError::Overflow)
    }

    fn commit(&mut self, sum: u64) {
        self.accumulator = sum;
        self.received += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    pub fn has_contributed(&self, contributor: usize) -> bool {
        self.contributors.contains(&contributor)
    }

    /// Produces the result and marks the round replied.
    pub fn finalize(&mut self) -> Result<RoundResult, FinalizeError> {
        if self.replied {
            return Err(FinalizeError::AlreadyReplied);
        }
        self.replied = true;
        Ok(RoundResult {
            sequence: self.sequence,
            sum: self.accumulator,
            received: self.received,
            expected: self.expected,
        })
    }
}
