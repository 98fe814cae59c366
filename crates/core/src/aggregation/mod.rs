//! Aggregation-round state machine.
//!
//! A [`Round`] holds the running sum for one sequence number at one node; a
//! [`RoundTable`] bounds how many rounds a node keeps open and ties each round
//! to its straggler timer. Everything here is single-threaded and never
//! panics on bad input: callers receive `Result`/`Option` and decide what to
//! drop.

use std::fmt;

use serde::{Deserialize, Serialize};

mod errors;
mod message;
mod name;
pub mod observer;
mod payload;
mod round;
mod table;
mod timer;

pub use errors::{AdmissionError, FinalizeError, FoldError, NameError, PayloadError};
pub use message::{Coverage, Message, Request, RequestId, Response};
pub use name::RequestName;
pub use observer::{AggregationEvent, AggregationObserver, DropReason, ObservedEvent};
pub use payload::{decode_value, encode_value, PAYLOAD_LEN};
pub use round::{Completion, Origin, Round, RoundResult};
pub use table::RoundTable;
pub use timer::{TimerHandle, TimerService};

/// Identifier of one aggregation round, unique among a node's open rounds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceId(u64);

impl SequenceId {
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id following this one, or `None` once the space is exhausted.
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
