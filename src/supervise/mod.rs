//! Process supervision: spawn, handshake, exit monitoring, graceful stop.
//!
//! [`start_session`] is the one-call path from a resolved spawn tuple to a
//! ready connection: spawn the process, wire its stdio into a connection
//! actor, start the exit monitor, and run the initialize handshake under
//! its dedicated timeout. Callers that need the pieces individually can use
//! the submodules directly.

pub mod monitor;
pub mod spawner;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{EngineConfig, SpawnConfig};
use crate::events::ConnectionEvent;
use crate::rpc::{spawn_connection, HandlerRegistry, RpcHandle};
use crate::{Result, RpcError};

pub use spawner::{AgentProcess, StderrTail};

/// A running agent session: live process, connection, and exit monitor.
#[derive(Debug)]
pub struct AgentSession {
    pub(crate) session_id: String,
    /// Handle for issuing calls into the session's connection.
    pub handle: RpcHandle,
    /// Event stream: notifications, decision requests, turn completion,
    /// teardown.
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Result payload of the initialize handshake.
    pub initialize_result: Value,
    pub(crate) cancel: CancellationToken,
    pub(crate) monitor: JoinHandle<()>,
}

impl AgentSession {
    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop the session: tear down the connection, give the process its
    /// stop grace period, force-kill if it lingers.
    pub async fn stop(self) {
        self.handle.shutdown().await;
        self.cancel.cancel();
        let _ = self.monitor.await;
    }
}

/// Spawn an agent process and bring its connection to the ready state.
///
/// The initialize handshake runs under [`EngineConfig::handshake_timeout`];
/// a handshake that does not complete in that window kills the process and
/// fails the whole startup.
///
/// # Errors
///
/// Returns [`RpcError::Startup`] for spawn-time failures,
/// [`RpcError::InitializeTimeout`] when the handshake window expires, or the
/// handshake call's own error otherwise.
pub async fn start_session(
    session_id: impl Into<String>,
    spawn: &SpawnConfig,
    config: Arc<EngineConfig>,
    handlers: HandlerRegistry,
) -> Result<AgentSession> {
    let session_id = session_id.into();
    let process = spawner::spawn_process(spawn).await?;
    let AgentProcess {
        child,
        stdin,
        stdout,
        stderr_tail,
    } = process;

    let (event_tx, events) = mpsc::unbounded_channel();
    let handle = spawn_connection(
        session_id.clone(),
        stdout,
        stdin,
        Arc::clone(&config),
        handlers,
        event_tx,
    );

    let cancel = CancellationToken::new();
    let monitor = monitor::spawn_exit_monitor(
        session_id.clone(),
        child,
        handle.clone(),
        stderr_tail,
        spawn.stop_grace(),
        cancel.clone(),
    );

    let params = match &config.handshake.params {
        Value::Null => None,
        other => Some(other.clone()),
    };
    let handshake = handle
        .call_with_timeout(
            config.handshake.method.clone(),
            params,
            config.handshake_timeout(),
        )
        .await
        .map_err(|err| match err {
            RpcError::Timeout { .. } => RpcError::InitializeTimeout,
            other => other,
        });

    match handshake {
        Ok(initialize_result) => {
            info!(session_id, "agent session ready");
            Ok(AgentSession {
                session_id,
                handle,
                events,
                initialize_result,
                cancel,
                monitor,
            })
        }
        Err(err) => {
            handle.shutdown().await;
            cancel.cancel();
            let _ = monitor.await;
            Err(err)
        }
    }
}
