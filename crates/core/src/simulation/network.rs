//! Simulated network layer with deterministic message delivery.
//!
//! Requests are routed by the first component of their name, responses back
//! to whoever issued the matching request. Every message that survives fault
//! injection becomes a delivery event on the scheduler.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;

use crate::aggregation::{Message, RequestId};

use super::{
    fault::FaultConfig,
    scheduler::{EventId, EventType, NodeId, Scheduler},
};

/// Statistics about the simulated network.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    /// Lost to random loss or a crashed endpoint.
    pub messages_dropped: u64,
    /// No node with that name, or a response nobody is waiting for.
    pub messages_unroutable: u64,
    /// Total latency added (nanoseconds)
    pub total_latency_nanos: u64,
}

impl NetworkStats {
    /// Returns average latency per scheduled message.
    pub fn average_latency(&self) -> Duration {
        let scheduled = self.messages_sent - self.messages_dropped - self.messages_unroutable;
        if scheduled == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_latency_nanos / scheduled)
        }
    }
}

/// A simulated network that delivers messages through the scheduler.
///
/// Uses BTreeMaps so that iteration order never depends on hashing state.
#[derive(Debug)]
pub struct SimulatedNetwork {
    index: BTreeMap<Arc<str>, NodeId>,
    fault_config: FaultConfig,
    /// Who issued each outstanding request.
    pending_requests: BTreeMap<RequestId, NodeId>,
    next_request_id: u64,
    stats: NetworkStats,
}

impl SimulatedNetwork {
    /// Creates a network over `names`; node `i` gets `NodeId(i)`.
    pub fn new(names: impl IntoIterator<Item = Arc<str>>) -> Self {
        let index = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, NodeId(i)))
            .collect();
        Self {
            index,
            fault_config: FaultConfig::new(),
            pending_requests: BTreeMap::new(),
            next_request_id: 0,
            stats: NetworkStats::default(),
        }
    }

    pub fn with_faults(mut self, config: FaultConfig) -> Self {
        self.fault_config = config;
        self
    }

    pub fn fault_config(&self) -> &FaultConfig {
        &self.fault_config
    }

    pub fn fault_config_mut(&mut self) -> &mut FaultConfig {
        &mut self.fault_config
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Network-wide unique request ids.
    pub fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        RequestId::new(self.next_request_id)
    }

    /// Resolves the destination. A response consumes its pending request
    /// whether or not it is delivered.
    fn route(&mut self, message: &Message) -> Option<NodeId> {
        match message {
            Message::Request(request) => self.node_id(request.name.head()),
            Message::Response(response) => self.pending_requests.remove(&response.request),
        }
    }

    /// Sends `message` from `from`.
    ///
    /// Returns the delivery event, or `None` if the message was unroutable
    /// or lost.
    pub fn send(
        &mut self,
        from: NodeId,
        message: Message,
        scheduler: &mut Scheduler,
    ) -> Option<EventId> {
        self.stats.messages_sent += 1;

        let Some(to) = self.route(&message) else {
            tracing::debug!(%from, name = %message.name(), "Message dropped: no route");
            self.stats.messages_unroutable += 1;
            return None;
        };

        if !self.fault_config.can_deliver(from, to, scheduler.rng()) {
            tracing::trace!(%from, %to, name = %message.name(), "Message dropped");
            self.stats.messages_dropped += 1;
            return None;
        }

        if let Message::Request(request) = &message {
            self.pending_requests.insert(request.id, from);
        }
        let latency = self.fault_config.generate_latency(from, scheduler.rng());
        self.stats.total_latency_nanos += latency.as_nanos() as u64;
        let event_id =
            scheduler.schedule_after(latency, EventType::Deliver { from, to, message });
        tracing::trace!(
            %from,
            %to,
            ?latency,
            event_id = event_id.as_u64(),
            "Message scheduled for delivery"
        );
        Some(event_id)
    }

    /// Accounts for a delivery event. Returns `false` if the target crashed
    /// while the message was in flight.
    pub fn process_delivery(&mut self, to: NodeId) -> bool {
        if self.fault_config.is_crashed(to) {
            self.stats.messages_dropped += 1;
            return false;
        }
        self.stats.messages_delivered += 1;
        true
    }
}
