//! Unit tests for the queue-outbound flow-control policy.
//!
//! An elicitation request closes the gate: outbound calls queue instead of
//! hitting the wire, and the human decision both answers the elicitation
//! and flushes the queue in FIFO order.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use tokio::time::advance;

use agent_conduit::config::{EngineConfig, FlowControlMode};
use agent_conduit::events::ConnectionEvent;
use agent_conduit::rpc::HandlerRegistry;
use agent_conduit::wire::{RequestEnvelope, ResponseEnvelope};
use agent_conduit::RpcError;

use super::connection_tests::{connect, issue, send_json, Wire};

fn queue_config(default_secs: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.gate.mode = FlowControlMode::QueueOutbound;
    config.timeouts.default_seconds = default_secs;
    config
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn send_elicitation(wire: &mut Wire, id: u64, call_id: &str) {
    send_json(
        wire,
        &json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "elicitation/create",
            "params": {"callId": call_id, "message": "Allow this tool?"}
        }),
    )
    .await;
    match wire.events.recv().await {
        Some(ConnectionEvent::DecisionRequested { call_id: got, .. }) => {
            assert_eq!(got, call_id);
        }
        other => panic!("expected decision request, got {other:?}"),
    }
}

async fn assert_wire_idle(wire: &mut Wire) {
    let idle = tokio::time::timeout(Duration::from_millis(50), wire.rx.next()).await;
    assert!(idle.is_err(), "engine wrote a frame while the gate was closed");
}

#[tokio::test(start_paused = true)]
async fn decision_answers_elicitation_and_flushes_queue_in_order() {
    let mut wire = connect(queue_config(60), HandlerRegistry::new());
    send_elicitation(&mut wire, 3, "c1").await;

    let first = issue(&wire.handle, "tool/alpha");
    settle().await;
    let second = issue(&wire.handle, "tool/beta");
    settle().await;
    assert_wire_idle(&mut wire).await;

    wire.handle
        .resolve_decision("c1", json!({"action": "accept"}))
        .await
        .expect("decision delivers");

    // First frame out is the elicitation response, keyed by the peer's id.
    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 3);
    assert_eq!(resp.result, Some(json!({"action": "accept"})));

    // Then the queued calls, FIFO, each with a fresh correlation id.
    let mut flushed = Vec::new();
    for _ in 0..2 {
        let line = wire.rx.next().await.expect("frame").expect("decodes");
        let req: RequestEnvelope = serde_json::from_str(&line).expect("request envelope");
        flushed.push(req);
    }
    assert_eq!(flushed[0].method, "tool/alpha");
    assert_eq!(flushed[1].method, "tool/beta");
    assert!(flushed[1].id > flushed[0].id);

    for (task, req) in [first, second].into_iter().zip(&flushed) {
        send_json(
            &mut wire,
            &json!({"jsonrpc": "2.0", "id": req.id, "result": {"ok": true}}),
        )
        .await;
        assert!(task.await.expect("task").is_ok());
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_or_consumed_call_id_is_rejected_without_a_duplicate_write() {
    let mut wire = connect(queue_config(60), HandlerRegistry::new());

    let err = wire
        .handle
        .resolve_decision("never-seen", json!({}))
        .await
        .expect_err("unknown id must fail");
    assert!(matches!(err, RpcError::AlreadyResolved(_)));

    send_elicitation(&mut wire, 3, "c1").await;
    wire.handle
        .resolve_decision("c1", json!({"action": "accept"}))
        .await
        .expect("first decision delivers");
    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 3);

    let err = wire
        .handle
        .resolve_decision("c1", json!({"action": "accept"}))
        .await
        .expect_err("second decision must fail");
    assert!(matches!(err, RpcError::AlreadyResolved(_)));
    assert_wire_idle(&mut wire).await;
}

#[tokio::test(start_paused = true)]
async fn gate_stays_closed_until_every_decision_resolves() {
    let mut wire = connect(queue_config(60), HandlerRegistry::new());
    send_elicitation(&mut wire, 3, "c1").await;
    send_elicitation(&mut wire, 4, "c2").await;

    let queued = issue(&wire.handle, "tool/gamma");
    settle().await;

    wire.handle
        .resolve_decision("c1", json!({"action": "accept"}))
        .await
        .expect("decision delivers");
    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 3);
    assert_wire_idle(&mut wire).await;

    wire.handle
        .resolve_decision("c2", json!({"action": "decline"}))
        .await
        .expect("decision delivers");
    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 4);

    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let req: RequestEnvelope = serde_json::from_str(&line).expect("request envelope");
    assert_eq!(req.method, "tool/gamma");
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id, "result": {"ok": true}}),
    )
    .await;
    assert!(queued.await.expect("task").is_ok());
}

#[tokio::test(start_paused = true)]
async fn queued_call_times_out_on_its_own_clock() {
    let mut wire = connect(queue_config(5), HandlerRegistry::new());
    send_elicitation(&mut wire, 3, "c1").await;

    let call = issue(&wire.handle, "tool/alpha");
    settle().await;

    advance(Duration::from_secs(6)).await;
    let err = call.await.expect("task").expect_err("queued call expires");
    assert!(matches!(err, RpcError::Timeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn queue_beyond_capacity_rejects_instead_of_buffering() {
    let mut config = queue_config(60);
    config.gate.max_queued_calls = 1;
    let mut wire = connect(config, HandlerRegistry::new());
    send_elicitation(&mut wire, 3, "c1").await;

    let first = issue(&wire.handle, "tool/alpha");
    settle().await;
    let err = wire
        .handle
        .call("tool/beta", None)
        .await
        .expect_err("over-capacity call must be rejected");
    assert!(matches!(err, RpcError::QueueFull(_)));
    assert!(!first.is_finished());
}

#[tokio::test(start_paused = true)]
async fn elicitation_without_call_id_is_answered_with_an_error() {
    let mut wire = connect(queue_config(60), HandlerRegistry::new());
    send_json(
        &mut wire,
        &json!({
            "jsonrpc": "2.0",
            "id": 8,
            "method": "elicitation/create",
            "params": {"message": "no id here"}
        }),
    )
    .await;

    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 8);
    assert!(resp.error.is_some());

    // The malformed request must not close the gate.
    let call = issue(&wire.handle, "tool/alpha");
    let line = wire.rx.next().await.expect("frame").expect("decodes");
    let req: RequestEnvelope = serde_json::from_str(&line).expect("request envelope");
    assert_eq!(req.method, "tool/alpha");
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id, "result": {}}),
    )
    .await;
    assert!(call.await.expect("task").is_ok());
}
