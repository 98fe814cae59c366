use thiserror::Error;

use super::SequenceId;

/// Reasons a round could not be admitted into a [`RoundTable`](super::RoundTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("round {0} is already open")]
    Duplicate(SequenceId),

    #[error("round table at capacity ({capacity} open rounds)")]
    AtCapacity { capacity: usize },

    #[error("{children} children exceed the per-round contributor count")]
    TooManyChildren { children: usize },
}

/// Reasons a contribution was refused by a [`Round`](super::Round).
///
/// A refused fold never changes the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FoldError {
    #[error("round already replied")]
    AlreadyReplied,

    #[error("round already holds all {expected} expected contributions")]
    Saturated { expected: u32 },

    #[error("contributor {0} already answered this round")]
    DuplicateContributor(usize),

    #[error("accumulator overflow")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FinalizeError {
    #[error("round already replied")]
    AlreadyReplied,
}

/// Failure to interpret a request name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,

    #[error("name must start with '/': {0}")]
    NotAbsolute(String),

    #[error("name contains an empty component: {0}")]
    EmptyComponent(String),

    #[error("trailing component is not a sequence number: {0}")]
    MalformedSequence(String),
}

/// Failure to decode an aggregate payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload length {actual} does not match the {expected}-byte aggregate width")]
    InvalidLength { expected: usize, actual: usize },
}
