//! Messages exchanged between tiers.
//!
//! The transport routes a [`Request`] by the head of its name and returns the
//! matching [`Response`] to whoever issued the request, keyed by [`RequestId`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::errors::{NameError, PayloadError};
use super::name::RequestName;
use super::payload::{decode_value, encode_value};
use super::SequenceId;

/// Opaque token identifying one issued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// How many of the expected contributors are folded into an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub received: u32,
    pub expected: u32,
}

impl Coverage {
    pub const FULL_LEAF: Coverage = Coverage {
        received: 1,
        expected: 1,
    };

    pub fn new(received: u32, expected: u32) -> Self {
        Self { received, expected }
    }

    pub fn is_full(&self) -> bool {
        self.received >= self.expected
    }

    /// Fraction of contributors heard from; `1.0` when nothing was expected.
    pub fn ratio(&self) -> f64 {
        if self.expected == 0 {
            1.0
        } else {
            f64::from(self.received) / f64::from(self.expected)
        }
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.received, self.expected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub name: RequestName,
}

impl Request {
    pub fn new(id: RequestId, name: RequestName) -> Self {
        Self { id, name }
    }

    pub fn sequence(&self) -> Result<SequenceId, NameError> {
        self.name.sequence()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The request this response answers.
    pub request: RequestId,
    pub name: RequestName,
    pub payload: Bytes,
    pub coverage: Coverage,
}

impl Response {
    /// Builds the response to `request` carrying `value`.
    pub fn answer(request: &Request, value: u64, coverage: Coverage) -> Self {
        Self {
            request: request.id,
            name: request.name.clone(),
            payload: encode_value(value),
            coverage,
        }
    }

    pub fn value(&self) -> Result<u64, PayloadError> {
        decode_value(&self.payload)
    }

    pub fn sequence(&self) -> Result<SequenceId, NameError> {
        self.name.sequence()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn name(&self) -> &RequestName {
        match self {
            Message::Request(r) => &r.name,
            Message::Response(r) => &r.name,
        }
    }
}

impl From<Request> for Message {
    fn from(value: Request) -> Self {
        Message::Request(value)
    }
}

impl From<Response> for Message {
    fn from(value: Response) -> Self {
        Message::Response(value)
    }
}
