//! Registry tests: capacity enforcement and lifecycle management.

use std::sync::Arc;

use agent_conduit::config::EngineConfig;
use agent_conduit::registry::ConnectionRegistry;
use agent_conduit::rpc::HandlerRegistry;
use agent_conduit::RpcError;

use super::session_tests::{responder, sh_spawn};

fn engine(max_sessions: u32) -> Arc<EngineConfig> {
    let mut engine = EngineConfig::default();
    engine.max_concurrent_sessions = max_sessions;
    Arc::new(engine)
}

#[tokio::test]
async fn capacity_is_enforced_and_slots_are_released_on_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = ConnectionRegistry::new(engine(1), HandlerRegistry::new());
    let spawn = sh_spawn(responder("sleep 30"), dir.path());

    let first = registry.start(&spawn).await.expect("first session starts");
    assert_eq!(registry.active_count().await, 1);

    let err = registry
        .start(&spawn)
        .await
        .expect_err("second session must hit the cap");
    match err {
        RpcError::Startup(msg) => assert!(msg.contains("capacity")),
        other => panic!("expected startup error, got {other}"),
    }

    registry.stop(&first.session_id).await.expect("stop");
    assert_eq!(registry.active_count().await, 0);

    let second = registry.start(&spawn).await.expect("freed slot is reusable");
    assert!(registry.handle(&second.session_id).await.is_some());
    registry.shutdown_all().await;
    assert_eq!(registry.active_count().await, 0);
}

#[tokio::test]
async fn concurrent_starts_cannot_exceed_the_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(ConnectionRegistry::new(engine(1), HandlerRegistry::new()));
    let spawn = sh_spawn(responder("sleep 30"), dir.path());

    // Both starts race through the slow spawn-and-handshake path; only one
    // may hold the single slot.
    let first = tokio::spawn({
        let registry = Arc::clone(&registry);
        let spawn = spawn.clone();
        async move { registry.start(&spawn).await }
    });
    let second = tokio::spawn({
        let registry = Arc::clone(&registry);
        let spawn = spawn.clone();
        async move { registry.start(&spawn).await }
    });

    let outcomes = [first.await.expect("join"), second.await.expect("join")];
    let started = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(started, 1, "exactly one start may win the single slot");
    for outcome in outcomes {
        if let Err(err) = outcome {
            match err {
                RpcError::Startup(msg) => assert!(msg.contains("capacity")),
                other => panic!("expected startup error, got {other}"),
            }
        }
    }
    assert_eq!(registry.active_count().await, 1);
    registry.shutdown_all().await;
}

#[tokio::test]
async fn stopping_an_unknown_session_errors() {
    let registry = ConnectionRegistry::new(engine(1), HandlerRegistry::new());
    let err = registry
        .stop("no-such-session")
        .await
        .expect_err("unknown id must fail");
    assert!(matches!(err, RpcError::Closed(_)));
}

#[tokio::test]
async fn kill_by_workspace_stops_only_matching_sessions() {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let registry = ConnectionRegistry::new(engine(2), HandlerRegistry::new());

    let spawn_a = sh_spawn(responder("sleep 30"), dir_a.path());
    let spawn_b = sh_spawn(responder("sleep 30"), dir_b.path());
    let in_a = registry.start(&spawn_a).await.expect("session in a");
    let in_b = registry.start(&spawn_b).await.expect("session in b");

    assert_eq!(registry.kill_by_workspace(dir_a.path()).await, 1);
    assert!(registry.handle(&in_a.session_id).await.is_none());
    assert!(registry.handle(&in_b.session_id).await.is_some());

    registry.shutdown_all().await;
}

#[tokio::test]
async fn kill_by_workspace_matches_equivalent_path_spellings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = ConnectionRegistry::new(engine(1), HandlerRegistry::new());
    let session = registry
        .start(&sh_spawn(responder("sleep 30"), dir.path()))
        .await
        .expect("session starts");

    // `<dir>/.` names the same workspace; canonicalization makes it match.
    let dotted = dir.path().join(".");
    assert_eq!(registry.kill_by_workspace(&dotted).await, 1);
    assert!(registry.handle(&session.session_id).await.is_none());
}
