//! Unit tests for the connection actor's correlation and dispatch paths.
//!
//! The actor is driven over an in-memory duplex pipe: the test plays the
//! agent, reading the frames the engine writes and writing frames back.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use agent_conduit::config::EngineConfig;
use agent_conduit::events::ConnectionEvent;
use agent_conduit::rpc::{spawn_connection, HandlerRegistry};
use agent_conduit::wire::{LineCodec, RequestEnvelope, ResponseEnvelope};
use agent_conduit::{Result, RpcError, RpcHandle};

// ── Harness ──────────────────────────────────────────────────────────────────

/// Install a per-test tracing subscriber honoring `RUST_LOG`. Later calls
/// are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Wire {
    pub handle: RpcHandle,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub rx: FramedRead<ReadHalf<DuplexStream>, LineCodec>,
    pub tx: FramedWrite<WriteHalf<DuplexStream>, LineCodec>,
}

pub fn connect(config: EngineConfig, handlers: HandlerRegistry) -> Wire {
    init_tracing();
    let (engine_side, agent_side) = tokio::io::duplex(1 << 16);
    let (engine_rd, engine_wr) = tokio::io::split(engine_side);
    let (event_tx, events) = mpsc::unbounded_channel();
    let handle = spawn_connection(
        "test-session",
        engine_rd,
        engine_wr,
        Arc::new(config),
        handlers,
        event_tx,
    );
    let (agent_rd, agent_wr) = tokio::io::split(agent_side);
    Wire {
        handle,
        events,
        rx: FramedRead::new(agent_rd, LineCodec::new()),
        tx: FramedWrite::new(agent_wr, LineCodec::new()),
    }
}

pub async fn next_request(wire: &mut Wire) -> RequestEnvelope {
    let line = wire
        .rx
        .next()
        .await
        .expect("engine closed its stream")
        .expect("frame decodes");
    serde_json::from_str(&line).expect("engine wrote a request envelope")
}

pub async fn send_json(wire: &mut Wire, value: &Value) {
    wire.tx
        .send(value.to_string())
        .await
        .expect("write to engine");
}

pub fn issue(handle: &RpcHandle, method: &str) -> tokio::task::JoinHandle<Result<Value>> {
    let handle = handle.clone();
    let method = method.to_owned();
    tokio::spawn(async move { handle.call(method, None).await })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn call_resolves_with_the_matching_response() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    let call = issue(&wire.handle, "fs/read_text_file");

    let req = next_request(&mut wire).await;
    assert_eq!(req.method, "fs/read_text_file");

    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id, "result": {"content": "hello"}}),
    )
    .await;

    let out = call.await.expect("task").expect("call succeeds");
    assert_eq!(out, json!({"content": "hello"}));
}

#[tokio::test]
async fn response_with_unknown_id_is_ignored() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    let call = issue(&wire.handle, "fs/read_text_file");
    let req = next_request(&mut wire).await;

    // A stray response for an id we never issued must not resolve the call.
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id + 1000, "result": "stray"}),
    )
    .await;
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id, "result": "real"}),
    )
    .await;

    let out = call.await.expect("task").expect("call succeeds");
    assert_eq!(out, json!("real"));
}

#[tokio::test]
async fn error_response_rejects_with_the_remote_payload() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    let call = issue(&wire.handle, "session/prompt");
    let req = next_request(&mut wire).await;

    send_json(
        &mut wire,
        &json!({
            "jsonrpc": "2.0",
            "id": req.id,
            "error": {"code": -32000, "message": "model overloaded"}
        }),
    )
    .await;

    let err = call.await.expect("task").expect_err("call must fail");
    match err {
        RpcError::Remote { code, message } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "model overloaded");
        }
        other => panic!("expected remote error, got {other}"),
    }
}

#[tokio::test]
async fn unknown_inbound_method_gets_method_not_found() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": 9, "method": "bogus/method"}),
    )
    .await;

    let line = wire.rx.next().await.expect("response").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 9);
    let error = resp.error.expect("error member");
    assert_eq!(error.code, -32601);
}

#[tokio::test]
async fn registered_handler_answers_inbound_requests() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("fs/read_text_file", |params| async move {
        let path = params
            .as_ref()
            .and_then(|p| p.get("path"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(json!({"content": format!("contents of {path}")}))
    });
    let mut wire = connect(EngineConfig::default(), handlers);

    send_json(
        &mut wire,
        &json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "fs/read_text_file",
            "params": {"path": "a.txt"}
        }),
    )
    .await;

    let line = wire.rx.next().await.expect("response").expect("decodes");
    let resp: ResponseEnvelope = serde_json::from_str(&line).expect("response envelope");
    assert_eq!(resp.id, 4);
    assert!(resp.result.is_some());
}

#[tokio::test]
async fn end_turn_marker_fires_turn_completed() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    let call = issue(&wire.handle, "session/prompt");
    let req = next_request(&mut wire).await;

    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id, "result": {"stopReason": "end_turn"}}),
    )
    .await;

    let out = call.await.expect("task").expect("call succeeds");
    assert_eq!(out, json!({"stopReason": "end_turn"}));
    match wire.events.recv().await {
        Some(ConnectionEvent::TurnCompleted { stop_reason }) => {
            assert_eq!(stop_reason, json!("end_turn"));
        }
        other => panic!("expected turn completion, got {other:?}"),
    }
}

#[tokio::test]
async fn notifications_are_forwarded_as_events() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "method": "custom/event", "params": {"n": 1}}),
    )
    .await;

    match wire.events.recv().await {
        Some(ConnectionEvent::Notification { method, params }) => {
            assert_eq!(method, "custom/event");
            assert_eq!(params, json!({"n": 1}));
        }
        other => panic!("expected notification event, got {other:?}"),
    }
}

#[tokio::test]
async fn two_envelopes_in_one_chunk_are_processed_in_order() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());

    // One write carrying two newline-separated envelopes.
    let first = json!({"jsonrpc": "2.0", "method": "session/update", "params": {"seq": 1}});
    let second = json!({"jsonrpc": "2.0", "method": "session/update", "params": {"seq": 2}});
    wire.tx
        .send(format!("{first}\n{second}"))
        .await
        .expect("write to engine");

    for expected in [1, 2] {
        match wire.events.recv().await {
            Some(ConnectionEvent::Notification { params, .. }) => {
                assert_eq!(params, json!({"seq": expected}));
            }
            other => panic!("expected notification event, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn startup_banner_lines_are_tolerated() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());
    let call = issue(&wire.handle, "initialize");
    let req = next_request(&mut wire).await;

    wire.tx
        .send("Welcome to agent CLI v2.1!".to_owned())
        .await
        .expect("write to engine");
    send_json(
        &mut wire,
        &json!({"jsonrpc": "2.0", "id": req.id, "result": {"protocolVersion": 1}}),
    )
    .await;

    let out = call.await.expect("task").expect("call succeeds");
    assert_eq!(out, json!({"protocolVersion": 1}));
}

#[tokio::test]
async fn correlation_ids_increase_across_calls() {
    let mut wire = connect(EngineConfig::default(), HandlerRegistry::new());

    let first = issue(&wire.handle, "fs/read_text_file");
    let req_a = next_request(&mut wire).await;
    let second = issue(&wire.handle, "fs/read_text_file");
    let req_b = next_request(&mut wire).await;
    assert!(req_b.id > req_a.id);

    for (task, req) in [(first, req_a), (second, req_b)] {
        send_json(
            &mut wire,
            &json!({"jsonrpc": "2.0", "id": req.id, "result": {}}),
        )
        .await;
        assert!(task.await.expect("task").is_ok());
    }
}
