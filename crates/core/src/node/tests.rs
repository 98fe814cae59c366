use std::sync::Arc;
use std::time::Duration;

use crate::aggregation::observer::RecordingObserver;
use crate::aggregation::{
    AggregationEvent, Coverage, Message, Request, RequestId, RequestName, Response, SequenceId,
};
use crate::congestion::{
    CongestionControl, CongestionControlAlgorithm, CongestionControlConfig, PartialTimeoutPolicy,
};
use crate::simulation::VirtualTime;

use super::*;

const TIMEOUT: Duration = Duration::from_secs(1);

fn aggregator_node(observer: Arc<RecordingObserver>) -> Node<VirtualTime> {
    Node::new(
        "agg1",
        AggregatorRole::new(
            "agg1".into(),
            vec!["l1".into(), "l2".into(), "l3".into()],
            10,
            TIMEOUT,
            observer,
        ),
    )
}

fn open(node: &mut Node<VirtualTime>, ctx: &mut ManualContext, seq: u64) -> Vec<Request> {
    let request = Request::new(
        RequestId::new(1_000 + seq),
        RequestName::for_child("agg1", SequenceId::new(seq)),
    );
    node.on_message(Message::Request(request), ctx);
    ctx.take_sent()
        .into_iter()
        .filter_map(|m| match m {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        })
        .collect()
}

fn answer(requests: &[Request], child: &str, value: u64) -> Message {
    let request = requests
        .iter()
        .find(|r| r.name.head() == child)
        .expect("request for child");
    Message::Response(Response::answer(request, value, Coverage::FULL_LEAF))
}

fn single_reply(ctx: &mut ManualContext) -> Response {
    let mut sent = ctx.take_sent();
    assert_eq!(sent.len(), 1, "expected exactly one reply, got {sent:?}");
    match sent.remove(0) {
        Message::Response(r) => r,
        other => panic!("expected a response, got {other:?}"),
    }
}

#[test_log::test]
fn all_children_answer_before_deadline() {
    let observer = Arc::new(RecordingObserver::new());
    let mut node = aggregator_node(observer.clone());
    let mut ctx = ManualContext::new();
    let requests = open(&mut node, &mut ctx, 1);

    ctx.advance(Duration::from_millis(300));
    node.on_message(answer(&requests, "l1", 2), &mut ctx);
    node.on_message(answer(&requests, "l2", 5), &mut ctx);
    ctx.advance(Duration::from_millis(300));
    node.on_message(answer(&requests, "l3", 9), &mut ctx);

    let reply = single_reply(&mut ctx);
    assert_eq!(reply.value().unwrap(), 16);
    assert_eq!(reply.coverage, Coverage::new(3, 3));

    // The deadline passes without anything firing.
    assert!(ctx.advance(TIMEOUT).is_empty());
    assert_eq!(
        observer.count(|e| matches!(e, AggregationEvent::RoundCompleted { .. })),
        1
    );
}

#[test_log::test]
fn straggler_deadline_emits_partial_sum() {
    let observer = Arc::new(RecordingObserver::new());
    let mut node = aggregator_node(observer.clone());
    let mut ctx = ManualContext::new();
    let requests = open(&mut node, &mut ctx, 1);

    node.on_message(answer(&requests, "l1", 2), &mut ctx);
    node.on_message(answer(&requests, "l2", 5), &mut ctx);
    for (handle, seq) in ctx.advance(TIMEOUT) {
        node.on_timer(seq, handle, &mut ctx);
    }
    let reply = single_reply(&mut ctx);
    assert_eq!(reply.value().unwrap(), 7);
    assert_eq!(reply.coverage, Coverage::new(2, 3));
    assert!(node.as_aggregator().unwrap().rounds().is_empty());

    node.on_message(answer(&requests, "l3", 9), &mut ctx);
    assert!(ctx.sent().is_empty());
    assert_eq!(
        observer.completions("agg1"),
        vec![(SequenceId::new(1), 7, 2, 3)]
    );
}

#[test_log::test]
fn second_request_for_open_sequence_is_rejected() {
    let observer = Arc::new(RecordingObserver::new());
    let mut node = aggregator_node(observer.clone());
    let mut ctx = ManualContext::new();
    assert_eq!(open(&mut node, &mut ctx, 5).len(), 3);
    assert!(open(&mut node, &mut ctx, 5).is_empty());

    let rounds = node.as_aggregator().unwrap().rounds();
    assert_eq!(rounds.len(), 1);
    assert!(rounds.contains(SequenceId::new(5)));
}

#[test_log::test]
fn root_window_grows_to_four_after_three_successes() {
    let mut node: Node<VirtualTime> = Node::new(
        "root",
        RootRole::new(
            "root".into(),
            vec!["l1".into()],
            100,
            TIMEOUT,
            CongestionControlConfig::new(CongestionControlAlgorithm::Aimd)
                .with_ssthresh(10)
                .build_with_time_source(VirtualTime::new()),
            PartialTimeoutPolicy::default(),
            Some(3),
            Arc::new(RecordingObserver::new()),
        ),
    );
    let mut ctx = ManualContext::new();
    node.on_start(&mut ctx).unwrap();
    loop {
        let sent = ctx.take_sent();
        if sent.is_empty() {
            break;
        }
        for message in sent {
            if let Message::Request(request) = message {
                node.on_message(
                    Message::Response(Response::answer(&request, 1, Coverage::FULL_LEAF)),
                    &mut ctx,
                );
            }
        }
    }
    let root = node.as_root().unwrap();
    assert_eq!(root.stats().completed_full, 3);
    assert_eq!(root.controller().window(), 4);
    assert!(root.is_done());
}

#[test_log::test]
fn late_timer_after_completion_is_ignored() {
    let observer = Arc::new(RecordingObserver::new());
    let mut node = aggregator_node(observer.clone());
    let mut ctx = ManualContext::new();
    let requests = open(&mut node, &mut ctx, 1);
    let handle = node
        .as_aggregator()
        .unwrap()
        .rounds()
        .get(SequenceId::new(1))
        .and_then(|r| r.timer())
        .unwrap();
    for child in ["l1", "l2", "l3"] {
        node.on_message(answer(&requests, child, 1), &mut ctx);
    }
    single_reply(&mut ctx);

    node.on_timer(SequenceId::new(1), handle, &mut ctx);
    assert!(ctx.sent().is_empty());
    assert_eq!(
        observer.count(|e| matches!(e, AggregationEvent::RoundCompleted { .. })),
        1
    );
}

#[test_log::test]
fn misrouted_messages_are_dropped() {
    let mut leaf: Node<VirtualTime> = Node::new("l1", LeafRole::new("l1".into(), 3));
    let mut ctx = ManualContext::new();
    let request = Request::new(
        RequestId::new(1),
        RequestName::for_child("l1", SequenceId::new(1)),
    );
    leaf.on_message(
        Message::Response(Response::answer(&request, 1, Coverage::FULL_LEAF)),
        &mut ctx,
    );
    assert!(ctx.sent().is_empty());
    assert!(leaf.children().is_empty());
    assert_eq!(leaf.role().kind(), "leaf");
    assert!(leaf.on_start(&mut ctx).is_ok());
}

#[test_log::test]
fn childless_root_fails_to_start() {
    let mut node: Node<VirtualTime> = Node::new(
        "root",
        RootRole::new(
            "root".into(),
            Vec::new(),
            10,
            TIMEOUT,
            CongestionControlConfig::default().build_with_time_source(VirtualTime::new()),
            PartialTimeoutPolicy::default(),
            None,
            Arc::new(RecordingObserver::new()),
        ),
    );
    let mut ctx = ManualContext::new();
    assert_eq!(
        node.on_start(&mut ctx),
        Err(NodeError::Root(RootError::NoChildren("root".into())))
    );
}
