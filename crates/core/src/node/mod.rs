//! Aggregation tree nodes.
//!
//! A [`Node`] is a name plus exactly one role, picked at construction:
//! - [`RootRole`]: originates rounds under a congestion window.
//! - [`AggregatorRole`]: fans parent requests out and sums the answers.
//! - [`LeafRole`]: answers requests with a configured value.
//!
//! Nodes never touch the network or clock directly; every handler receives a
//! [`NodeContext`] from its host (the simulation harness, or
//! [`ManualContext`] in tests).

use std::sync::Arc;

use crate::aggregation::{Message, SequenceId, TimerHandle};
use crate::simulation::{RealTime, TimeSource};

pub use self::aggregator::AggregatorRole;
pub use self::context::{ManualContext, NodeContext, Transport};
pub use self::leaf::LeafRole;
pub use self::root::{RootError, RootRole, RootStats, FIRST_SEQUENCE};

mod aggregator;
mod context;
mod engine;
mod leaf;
mod root;
#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NodeError {
    #[error(transparent)]
    Root(#[from] RootError),
}

pub enum NodeRole<T: TimeSource = RealTime> {
    Root(Box<RootRole<T>>),
    Aggregator(AggregatorRole),
    Leaf(LeafRole),
}

impl<T: TimeSource> NodeRole<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeRole::Root(_) => "root",
            NodeRole::Aggregator(_) => "aggregator",
            NodeRole::Leaf(_) => "leaf",
        }
    }
}

impl<T: TimeSource> From<RootRole<T>> for NodeRole<T> {
    fn from(role: RootRole<T>) -> Self {
        NodeRole::Root(Box::new(role))
    }
}

impl<T: TimeSource> From<AggregatorRole> for NodeRole<T> {
    fn from(role: AggregatorRole) -> Self {
        NodeRole::Aggregator(role)
    }
}

impl<T: TimeSource> From<LeafRole> for NodeRole<T> {
    fn from(role: LeafRole) -> Self {
        NodeRole::Leaf(role)
    }
}

pub struct Node<T: TimeSource = RealTime> {
    name: Arc<str>,
    role: NodeRole<T>,
}

impl<T: TimeSource> Node<T> {
    pub fn new(name: impl Into<Arc<str>>, role: impl Into<NodeRole<T>>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &NodeRole<T> {
        &self.role
    }

    pub fn as_root(&self) -> Option<&RootRole<T>> {
        match &self.role {
            NodeRole::Root(root) => Some(root.as_ref()),
            _ => None,
        }
    }

    pub fn as_aggregator(&self) -> Option<&AggregatorRole> {
        match &self.role {
            NodeRole::Aggregator(agg) => Some(agg),
            _ => None,
        }
    }

    /// Child names this node fans out to; empty for leaves.
    pub fn children(&self) -> &[String] {
        match &self.role {
            NodeRole::Root(root) => root.children(),
            NodeRole::Aggregator(agg) => agg.children(),
            NodeRole::Leaf(_) => &[],
        }
    }

    pub fn on_start(&mut self, ctx: &mut impl NodeContext) -> Result<(), NodeError> {
        if let NodeRole::Root(root) = &mut self.role {
            root.on_start(ctx)?;
        }
        Ok(())
    }

    pub fn on_message(&mut self, message: Message, ctx: &mut impl NodeContext) {
        match (&mut self.role, message) {
            (NodeRole::Aggregator(agg), Message::Request(request)) => agg.on_request(request, ctx),
            (NodeRole::Leaf(leaf), Message::Request(request)) => leaf.on_request(request, ctx),
            (NodeRole::Aggregator(agg), Message::Response(response)) => {
                agg.on_response(&response, ctx)
            }
            (NodeRole::Root(root), Message::Response(response)) => {
                root.on_response(&response, ctx)
            }
            (role, message) => {
                tracing::warn!(
                    node = %self.name,
                    role = role.kind(),
                    name = %message.name(),
                    "Message not handled by this role"
                );
            }
        }
    }

    pub fn on_timer(&mut self, seq: SequenceId, handle: TimerHandle, ctx: &mut impl NodeContext) {
        match &mut self.role {
            NodeRole::Root(root) => root.on_timer(seq, handle, ctx),
            NodeRole::Aggregator(agg) => agg.on_timer(seq, handle, ctx),
            NodeRole::Leaf(_) => {
                tracing::debug!(node = %self.name, %seq, "Leaf ignores timer");
            }
        }
    }

    /// Cancels all open rounds. Returns how many were dropped.
    pub fn on_stop(&mut self, ctx: &mut impl NodeContext) -> usize {
        let dropped = match &mut self.role {
            NodeRole::Root(root) => root.on_stop(ctx),
            NodeRole::Aggregator(agg) => agg.on_stop(ctx),
            NodeRole::Leaf(_) => 0,
        };
        if dropped > 0 {
            tracing::debug!(node = %self.name, dropped, "Open rounds dropped on stop");
        }
        dropped
    }
}

impl<T: TimeSource> std::fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("role", &self.role.kind())
            .finish()
    }
}
