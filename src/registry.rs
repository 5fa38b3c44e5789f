//! Session registry: bounded set of live agent sessions.
//!
//! The registry is the host-facing entry point for multi-session use. It
//! owns one [`ActiveSession`] record per live agent, enforces the
//! configured concurrency cap, and can stop sessions individually, by
//! workspace, or all at once for shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, SpawnConfig};
use crate::events::ConnectionEvent;
use crate::rpc::{HandlerRegistry, RpcHandle};
use crate::supervise::{start_session, AgentSession};
use crate::{Result, RpcError};

/// Canonical form of a workspace path for registry comparisons. Paths that
/// cannot be canonicalized (not yet created, for example) are used as given.
fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Bookkeeping for one live session held by the registry.
#[derive(Debug)]
struct ActiveSession {
    handle: RpcHandle,
    workspace: PathBuf,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
    /// Capacity slot; released when the session is removed.
    _slot: OwnedSemaphorePermit,
}

impl ActiveSession {
    async fn stop(self) {
        self.handle.shutdown().await;
        self.cancel.cancel();
        let _ = self.monitor.await;
    }
}

/// What the caller receives when a session starts: everything the registry
/// does not keep for itself.
#[derive(Debug)]
pub struct StartedSession {
    /// Generated session identifier, the key for later registry calls.
    pub session_id: String,
    /// Call handle into the session's connection.
    pub handle: RpcHandle,
    /// Event stream for this session.
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Result payload of the initialize handshake.
    pub initialize_result: Value,
}

/// Registry of live agent sessions, capped at the configured concurrency.
#[derive(Debug)]
pub struct ConnectionRegistry {
    config: Arc<EngineConfig>,
    handlers: HandlerRegistry,
    /// One permit per allowed concurrent session; a permit is reserved
    /// before the spawn begins so concurrent starts cannot oversubscribe.
    slots: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl ConnectionRegistry {
    /// Create a registry sharing one engine config and handler set across
    /// all sessions it starts.
    #[must_use]
    pub fn new(config: Arc<EngineConfig>, handlers: HandlerRegistry) -> Self {
        let cap = usize::try_from(config.max_concurrent_sessions).unwrap_or(usize::MAX);
        Self {
            config,
            handlers,
            slots: Arc::new(Semaphore::new(cap.min(Semaphore::MAX_PERMITS))),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new agent session with a generated identifier.
    ///
    /// Sessions whose process has already exited are pruned first, so a
    /// crashed agent never holds a slot; the capacity slot itself is
    /// reserved before the spawn begins and travels with the session
    /// record, so concurrent starts cannot exceed the cap.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Startup`] when at capacity or when the spawn
    /// fails, [`RpcError::InitializeTimeout`] when the handshake window
    /// expires.
    pub async fn start(&self, spawn: &SpawnConfig) -> Result<StartedSession> {
        self.sessions
            .lock()
            .await
            .retain(|_, s| s.handle.is_connected());

        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            return Err(RpcError::Startup(format!(
                "session capacity reached ({} active)",
                self.config.max_concurrent_sessions
            )));
        };

        let session_id = Uuid::new_v4().to_string();
        let session = start_session(
            session_id.clone(),
            spawn,
            Arc::clone(&self.config),
            self.handlers.clone(),
        )
        .await?;

        let AgentSession {
            handle,
            events,
            initialize_result,
            cancel,
            monitor,
            ..
        } = session;

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session_id.clone(),
            ActiveSession {
                handle: handle.clone(),
                workspace: normalize(&spawn.cwd),
                cancel,
                monitor,
                _slot: slot,
            },
        );

        Ok(StartedSession {
            session_id,
            handle,
            events,
            initialize_result,
        })
    }

    /// Stop one session by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] when no session exists under `session_id`.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let session = self.sessions.lock().await.remove(session_id);
        match session {
            Some(session) => {
                session.stop().await;
                Ok(())
            }
            None => Err(RpcError::Closed(format!(
                "no active session `{session_id}`"
            ))),
        }
    }

    /// Stop every session rooted at `workspace`. Returns how many stopped.
    ///
    /// Paths are canonicalized on both sides, so trailing separators and
    /// symlinked prefixes still match the workspace a session was started
    /// with.
    pub async fn kill_by_workspace(&self, workspace: &Path) -> usize {
        let workspace = normalize(workspace);
        let victims: Vec<ActiveSession> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.workspace == workspace)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };
        let count = victims.len();
        for session in victims {
            session.stop().await;
        }
        count
    }

    /// Handle for a live session, if one exists under `session_id`.
    pub async fn handle(&self, session_id: &str) -> Option<RpcHandle> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.handle.clone())
    }

    /// Number of tracked sessions (live or not yet pruned).
    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stop every session. Used at host shutdown.
    pub async fn shutdown_all(&self) {
        let victims: Vec<ActiveSession> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in victims {
            session.stop().await;
        }
    }
}
