use std::sync::Arc;

use crate::aggregation::{Coverage, Message, Request, Response};

use super::context::NodeContext;

/// A data source: answers every well-formed request with a fixed value.
#[derive(Debug, Clone)]
pub struct LeafRole {
    name: Arc<str>,
    value: u64,
}

impl LeafRole {
    pub fn new(name: Arc<str>, value: u64) -> Self {
        Self { name, value }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn on_request(&mut self, request: Request, ctx: &mut impl NodeContext) {
        match request.sequence() {
            Ok(seq) => {
                tracing::trace!(node = %self.name, %seq, value = self.value, "Answering request");
                let response = Response::answer(&request, self.value, Coverage::FULL_LEAF);
                ctx.send(Message::Response(response));
            }
            Err(error) => {
                tracing::warn!(
                    node = %self.name,
                    name = %request.name,
                    %error,
                    "Discarding request with malformed sequence"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{RequestId, RequestName, SequenceId};
    use crate::node::context::ManualContext;

    #[test]
    fn answers_with_value_under_request_name() {
        let mut leaf = LeafRole::new("leaf1".into(), 42);
        let mut ctx = ManualContext::new();
        let request = Request::new(
            RequestId::new(7),
            RequestName::for_child("leaf1", SequenceId::new(3)),
        );
        leaf.on_request(request.clone(), &mut ctx);

        let sent = ctx.take_sent();
        assert_eq!(
            sent,
            vec![Message::Response(Response::answer(
                &request,
                42,
                Coverage::FULL_LEAF
            ))]
        );
        let Message::Response(response) = &sent[0] else {
            unreachable!()
        };
        assert_eq!(response.value().unwrap(), 42);
        assert_eq!(response.request, RequestId::new(7));
    }

    #[test]
    fn malformed_sequence_gets_no_answer() {
        let mut leaf = LeafRole::new("leaf1".into(), 1);
        let mut ctx = ManualContext::new();
        let request = Request::new(RequestId::new(1), RequestName::parse("/leaf1/x").unwrap());
        leaf.on_request(request, &mut ctx);
        assert!(ctx.sent().is_empty());
    }
}
