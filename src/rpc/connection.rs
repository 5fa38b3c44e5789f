//! The per-connection actor: dispatcher, timeout controller, and gate.
//!
//! One connection owns one agent process's stdio streams and all of the
//! mutable RPC state (correlation table, flow-control gate). Every state
//! transition happens inside a single task reacting to exactly three event
//! sources — a command from a handle, a decoded line from the agent, or a
//! deadline firing — so table mutations are serialized by construction.
//!
//! Method handlers and the exit monitor run as separate tasks but re-enter
//! the actor through its command channel; they never touch the table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, FlowControlMode};
use crate::events::ConnectionEvent;
use crate::rpc::gate::{FlowGate, QueuedCall};
use crate::rpc::handlers::HandlerRegistry;
use crate::rpc::pending::{PendingTable, ResumeOutcome};
use crate::wire::{
    classify, Envelope, LineCodec, NotificationEnvelope, RequestEnvelope, ResponseEnvelope,
};
use crate::{Result, RpcError};

/// Grace window between observing stdout EOF and tearing down, giving the
/// exit monitor a chance to report the real exit status first.
const EOF_TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// JSON-RPC "method not found" error code.
const METHOD_NOT_FOUND: i64 = -32601;

// ── Commands ──────────────────────────────────────────────────────────────────

/// Messages accepted by the connection actor.
#[derive(Debug)]
enum Command {
    Call {
        method: String,
        params: Option<Value>,
        duration: Option<Duration>,
        tx: oneshot::Sender<Result<Value>>,
    },
    Notify {
        method: String,
        params: Option<Value>,
    },
    Pause {
        id: u64,
    },
    Resume {
        id: u64,
    },
    ResolveDecision {
        call_id: String,
        decision: Value,
        tx: oneshot::Sender<Result<()>>,
    },
    /// Outcome of a spawned method-handler task, written back as a response.
    Respond {
        id: u64,
        outcome: Result<Value>,
    },
    /// An approval handler finished (or hit its ceiling); resume the world.
    ApprovalSettled,
    /// Delivered by the exit monitor when the child process terminates.
    ProcessExited {
        code: Option<i32>,
        reason: String,
    },
    Shutdown {
        tx: oneshot::Sender<()>,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap, cloneable handle for issuing calls into one connection actor.
#[derive(Debug, Clone)]
pub struct RpcHandle {
    session_id: String,
    cmd_tx: mpsc::Sender<Command>,
    connected: Arc<AtomicBool>,
}

impl RpcHandle {
    /// Session identifier of the underlying connection.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the process handle exists and has not reported exit.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }

    /// Issue an outbound call with the method-dependent default duration.
    ///
    /// # Errors
    ///
    /// Rejects with [`RpcError::Timeout`] on expiry, [`RpcError::Remote`]
    /// when the peer answers with an error, [`RpcError::QueueFull`] when the
    /// gate's bounded queue is at capacity, or [`RpcError::Closed`] /
    /// [`RpcError::ProcessExit`] on teardown.
    pub async fn call(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.call_inner(method.into(), params, None).await
    }

    /// Issue an outbound call with an explicit duration, overriding the
    /// configured policy (used by the initialize handshake).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::call`].
    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        duration: Duration,
    ) -> Result<Value> {
        self.call_inner(method.into(), params, Some(duration)).await
    }

    async fn call_inner(
        &self,
        method: String,
        params: Option<Value>,
        duration: Option<Duration>,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Call {
            method,
            params,
            duration,
            tx,
        })
        .await?;
        rx.await
            .map_err(|_| RpcError::Closed("connection task ended".into()))?
    }

    /// Send a fire-and-forget notification to the agent.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] if the connection actor has ended.
    pub async fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<()> {
        self.send(Command::Notify {
            method: method.into(),
            params,
        })
        .await
    }

    /// Stop the clock of one outstanding call.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] if the connection actor has ended.
    pub async fn pause(&self, id: u64) -> Result<()> {
        self.send(Command::Pause { id }).await
    }

    /// Re-arm one paused call with its remaining budget. A call whose
    /// budget expired while paused is rejected immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] if the connection actor has ended.
    pub async fn resume(&self, id: u64) -> Result<()> {
        self.send(Command::Resume { id }).await
    }

    /// Deliver a human decision for an outstanding elicitation.
    ///
    /// Writes exactly one response envelope keyed by the mapped request id,
    /// consumes the mapping, and flushes the outbound queue once no other
    /// decisions remain outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::AlreadyResolved`] for unknown or already-consumed
    /// call identifiers, or [`RpcError::Closed`] if the actor has ended.
    pub async fn resolve_decision(&self, call_id: impl Into<String>, decision: Value) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ResolveDecision {
            call_id: call_id.into(),
            decision,
            tx,
        })
        .await?;
        rx.await
            .map_err(|_| RpcError::Closed("connection task ended".into()))?
    }

    /// Report child-process termination. Invoked by the exit monitor; fails
    /// every outstanding call with a process-exit error and tears down.
    pub async fn process_exited(&self, code: Option<i32>, reason: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::ProcessExited {
                code,
                reason: reason.into(),
            })
            .await;
    }

    /// Tear down the connection, rejecting all outstanding work.
    ///
    /// Idempotent: stopping an already-stopped connection is a no-op.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| RpcError::Closed("connection task ended".into()))
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

/// Spawn the connection actor over arbitrary duplex streams.
///
/// `reader` is the agent's stdout, `writer` its stdin; tests substitute
/// in-memory pipes. The returned handle is the only way to reach the actor.
pub fn spawn_connection<R, W>(
    session_id: impl Into<String>,
    reader: R,
    writer: W,
    config: Arc<EngineConfig>,
    handlers: HandlerRegistry,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) -> RpcHandle
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let session_id = session_id.into();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let connected = Arc::new(AtomicBool::new(true));

    let actor = Connection {
        session_id: session_id.clone(),
        config: Arc::clone(&config),
        handlers,
        events: event_tx,
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        framed_rx: FramedRead::new(reader, LineCodec::new()),
        framed_tx: FramedWrite::new(writer, LineCodec::new()),
        table: PendingTable::new(),
        gate: FlowGate::new(config.gate.max_queued_calls),
        approval_depth: 0,
        eof_deadline: None,
        connected: Arc::clone(&connected),
    };
    tokio::spawn(actor.run());

    RpcHandle {
        session_id,
        cmd_tx,
        connected,
    }
}

/// Why the connection is being torn down; decides the rejection error.
enum TeardownCause {
    Exit(Option<i32>),
    Closed(String),
}

impl TeardownCause {
    fn error(&self) -> RpcError {
        match self {
            Self::Exit(code) => RpcError::ProcessExit { code: *code },
            Self::Closed(reason) => RpcError::Closed(reason.clone()),
        }
    }
}

struct Connection<R, W> {
    session_id: String,
    config: Arc<EngineConfig>,
    handlers: HandlerRegistry,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    framed_rx: FramedRead<R, LineCodec>,
    framed_tx: FramedWrite<W, LineCodec>,
    table: PendingTable,
    gate: FlowGate,
    /// Nesting depth of in-flight approval handlers; the world resumes when
    /// it returns to zero.
    approval_depth: u32,
    /// Armed after stdout EOF; teardown fires if no exit report arrives.
    eof_deadline: Option<Instant>,
    connected: Arc<AtomicBool>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        loop {
            let next = self.next_deadline();
            let stream_open = self.eof_deadline.is_none();
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => {
                            self.teardown(TeardownCause::Closed("all handles dropped".into()));
                            break;
                        }
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                    }
                }

                item = self.framed_rx.next(), if stream_open => {
                    match item {
                        None => {
                            debug!(session_id = %self.session_id, "agent stdout EOF");
                            self.eof_deadline = Some(Instant::now() + EOF_TEARDOWN_GRACE);
                        }
                        Some(Err(RpcError::Io(msg))) => {
                            warn!(session_id = %self.session_id, error = %msg, "stream error");
                            self.eof_deadline = Some(Instant::now() + EOF_TEARDOWN_GRACE);
                        }
                        Some(Err(err)) => {
                            // Codec framing error (e.g. line too long) — skip.
                            warn!(session_id = %self.session_id, %err, "framing error, skipping line");
                        }
                        Some(Ok(line)) => self.handle_line(&line).await,
                    }
                }

                () = deadline_sleep(next) => {
                    if self.on_deadline() {
                        break;
                    }
                }
            }
        }
    }

    // ── Command handling ─────────────────────────────────────────────────

    /// Returns `true` when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Call {
                method,
                params,
                duration,
                tx,
            } => {
                self.handle_call(method, params, duration, tx).await;
            }
            Command::Notify { method, params } => {
                self.write_line(&NotificationEnvelope::new(method, params))
                    .await;
            }
            Command::Pause { id } => {
                if self.table.pause(id, Instant::now()) {
                    debug!(session_id = %self.session_id, id, "call paused");
                }
            }
            Command::Resume { id } => {
                let now = Instant::now();
                match self.table.resume(id, now) {
                    ResumeOutcome::Rearmed => {
                        debug!(session_id = %self.session_id, id, "call resumed");
                    }
                    ResumeOutcome::Expired(entry) => {
                        let err = entry.timeout_error(now);
                        warn!(session_id = %self.session_id, id, method = %entry.method,
                            "budget exhausted while paused, rejecting");
                        let _ = entry.tx.send(Err(err));
                    }
                    ResumeOutcome::NotPaused => {}
                }
            }
            Command::ResolveDecision {
                call_id,
                decision,
                tx,
            } => {
                self.handle_resolve_decision(&call_id, decision, tx).await;
            }
            Command::Respond { id, outcome } => {
                let envelope = match outcome {
                    Ok(value) => ResponseEnvelope::success(id, value),
                    Err(err) => {
                        ResponseEnvelope::failure(id, err.json_rpc_code(), err.to_string())
                    }
                };
                self.write_line(&envelope).await;
            }
            Command::ApprovalSettled => self.on_approval_settled(),
            Command::ProcessExited { code, reason } => {
                info!(session_id = %self.session_id, ?code, reason, "agent process exited");
                self.teardown(TeardownCause::Exit(code));
                return true;
            }
            Command::Shutdown { tx } => {
                self.teardown(TeardownCause::Closed("connection stopped".into()));
                let _ = tx.send(());
                return true;
            }
        }
        false
    }

    async fn handle_call(
        &mut self,
        method: String,
        params: Option<Value>,
        duration: Option<Duration>,
        tx: oneshot::Sender<Result<Value>>,
    ) {
        let duration = duration.unwrap_or_else(|| self.config.timeouts.duration_for(&method));
        let now = Instant::now();

        if self.gate.is_paused() && self.config.gate.mode == FlowControlMode::QueueOutbound {
            let queued = QueuedCall {
                method,
                params,
                tx,
                issued_at: now,
                duration,
                deadline: now + duration,
            };
            match self.gate.enqueue(queued) {
                Ok(()) => {
                    debug!(session_id = %self.session_id,
                        queued = self.gate.queued_len(), "call queued behind elicitation");
                }
                Err(rejected) => {
                    let err = RpcError::QueueFull(format!(
                        "`{}` rejected while a decision is outstanding",
                        rejected.method
                    ));
                    let _ = rejected.tx.send(Err(err));
                }
            }
            return;
        }

        let id = self.table.allocate_id();
        let envelope = RequestEnvelope::new(id, method.clone(), params);
        self.table.register(id, method, tx, duration, now);
        self.write_line(&envelope).await;
    }

    async fn handle_resolve_decision(
        &mut self,
        call_id: &str,
        decision: Value,
        tx: oneshot::Sender<Result<()>>,
    ) {
        match self.gate.take_elicitation(call_id) {
            Err(err) => {
                let _ = tx.send(Err(err));
            }
            Ok(request_id) => {
                debug!(session_id = %self.session_id, call_id, request_id, "decision delivered");
                self.write_line(&ResponseEnvelope::success(request_id, decision))
                    .await;

                let flushed = self.gate.reopen_if_idle();
                let now = Instant::now();
                for call in flushed {
                    let id = self.table.allocate_id();
                    let envelope = RequestEnvelope::new(id, call.method.clone(), call.params);
                    self.table.register_with_deadline(
                        id,
                        call.method,
                        call.tx,
                        call.duration,
                        call.issued_at,
                        call.deadline,
                        now,
                    );
                    self.write_line(&envelope).await;
                }
                let _ = tx.send(Ok(()));
            }
        }
    }

    fn on_approval_settled(&mut self) {
        self.approval_depth = self.approval_depth.saturating_sub(1);
        if self.approval_depth > 0 {
            return;
        }
        let timeouts = self.config.timeouts.clone();
        let now = Instant::now();
        for (id, entry) in self
            .table
            .resume_matching(|m| timeouts.is_long_running(m), now)
        {
            let err = entry.timeout_error(now);
            warn!(session_id = %self.session_id, id, method = %entry.method,
                "budget exhausted during approval wait, rejecting");
            let _ = entry.tx.send(Err(err));
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────

    async fn handle_line(&mut self, line: &str) {
        let Some(envelope) = classify(line) else {
            // Non-protocol chatter (startup banners etc.) is tolerated.
            debug!(session_id = %self.session_id, raw = line, "discarding non-envelope line");
            return;
        };
        match envelope {
            Envelope::Response(resp) => self.handle_response(resp),
            Envelope::Request(req) => self.handle_request(req).await,
            Envelope::Notification(note) => self.handle_notification(note),
        }
    }

    fn handle_response(&mut self, resp: ResponseEnvelope) {
        let Some(entry) = self.table.complete(resp.id) else {
            debug!(session_id = %self.session_id, id = resp.id, "response matches no pending call");
            return;
        };
        if let Some(err) = resp.error {
            let _ = entry.tx.send(Err(RpcError::Remote {
                code: err.code,
                message: err.message,
            }));
            return;
        }
        let result = resp.result.unwrap_or(Value::Null);
        if let Some(marker) = result.get(&self.config.end_turn_marker) {
            let _ = self.events.send(ConnectionEvent::TurnCompleted {
                stop_reason: marker.clone(),
            });
        }
        let _ = entry.tx.send(Ok(result));
    }

    async fn handle_request(&mut self, req: RequestEnvelope) {
        if self.config.gate.mode == FlowControlMode::QueueOutbound
            && req.method == self.config.gate.elicitation_method
        {
            self.handle_elicitation(req).await;
            return;
        }

        let Some(handler) = self.handlers.get(&req.method) else {
            self.write_line(&ResponseEnvelope::failure(
                req.id,
                METHOD_NOT_FOUND,
                format!("method `{}` not found", req.method),
            ))
            .await;
            return;
        };

        let is_approval = self.config.gate.mode == FlowControlMode::PauseTimers
            && self.config.gate.approval_methods.iter().any(|m| *m == req.method);

        let id = req.id;
        let params = req.params;
        let cmd_tx = self.cmd_tx.clone();

        if is_approval {
            self.approval_depth += 1;
            if self.approval_depth == 1 {
                let timeouts = self.config.timeouts.clone();
                let paused = self
                    .table
                    .pause_matching(|m| timeouts.is_long_running(m), Instant::now());
                debug!(session_id = %self.session_id, paused,
                    "paused long-running calls for approval wait");
            }
            let ceiling = self.config.decision_ceiling();
            let denial = self.config.gate.denial_response.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                let outcome = match tokio::time::timeout(ceiling, handler(params)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(session_id, id, "approval wait exceeded ceiling, denying");
                        Ok(denial)
                    }
                };
                // Respond before resuming so the decision is on the wire
                // ahead of any traffic the resume releases.
                let _ = cmd_tx.send(Command::Respond { id, outcome }).await;
                let _ = cmd_tx.send(Command::ApprovalSettled).await;
            });
        } else {
            tokio::spawn(async move {
                let outcome = handler(params).await;
                let _ = cmd_tx.send(Command::Respond { id, outcome }).await;
            });
        }
    }

    async fn handle_elicitation(&mut self, req: RequestEnvelope) {
        let call_id = req
            .params
            .as_ref()
            .and_then(|p| p.get(&self.config.gate.call_id_param))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let Some(call_id) = call_id else {
            // Missing identifier: answer immediately instead of pausing on
            // a request we could never resolve.
            let err = RpcError::Protocol(format!(
                "elicitation request missing `{}` param",
                self.config.gate.call_id_param
            ));
            self.write_line(&ResponseEnvelope::failure(
                req.id,
                err.json_rpc_code(),
                err.to_string(),
            ))
            .await;
            return;
        };

        match self.gate.record_elicitation(call_id.clone(), req.id) {
            Ok(()) => {
                debug!(session_id = %self.session_id, call_id, id = req.id,
                    "elicitation received, outbound sends paused");
                let _ = self.events.send(ConnectionEvent::DecisionRequested {
                    call_id,
                    method: req.method,
                    params: req.params.unwrap_or(Value::Null),
                });
            }
            Err(err) => {
                self.write_line(&ResponseEnvelope::failure(
                    req.id,
                    err.json_rpc_code(),
                    err.to_string(),
                ))
                .await;
            }
        }
    }

    fn handle_notification(&mut self, note: NotificationEnvelope) {
        if self.config.is_liveness_signal(&note.method) {
            let timeouts = self.config.timeouts.clone();
            let reset = self
                .table
                .reset_matching(|m| timeouts.is_long_running(m), Instant::now());
            if reset > 0 {
                debug!(session_id = %self.session_id, reset, method = %note.method,
                    "liveness signal re-armed long-running deadlines");
            }
        }
        let _ = self.events.send(ConnectionEvent::Notification {
            method: note.method,
            params: note.params.unwrap_or(Value::Null),
        });
    }

    // ── Deadlines & teardown ─────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.table.next_deadline(),
            self.gate.next_deadline(),
            self.eof_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Returns `true` when the actor should stop.
    fn on_deadline(&mut self) -> bool {
        let now = Instant::now();

        for (id, entry) in self.table.expired(now) {
            let err = entry.timeout_error(now);
            warn!(session_id = %self.session_id, id, method = %entry.method,
                elapsed_secs = entry.elapsed_secs(now), "call timed out");
            let _ = entry.tx.send(Err(err));
        }

        for call in self.gate.expired(now) {
            let err = RpcError::Timeout {
                method: call.method.clone(),
                elapsed_secs: now.saturating_duration_since(call.issued_at).as_secs(),
            };
            warn!(session_id = %self.session_id, method = %call.method,
                "queued call timed out awaiting a decision");
            let _ = call.tx.send(Err(err));
        }

        if self.eof_deadline.is_some_and(|d| d <= now) {
            self.teardown(TeardownCause::Closed("agent stream closed".into()));
            return true;
        }
        false
    }

    fn teardown(&mut self, cause: TeardownCause) {
        self.connected.store(false, Ordering::SeqCst);

        let pending = self.table.drain();
        let queued = self.gate.clear();
        let rejected = pending.len() + queued.len();
        for (_, entry) in pending {
            let _ = entry.tx.send(Err(cause.error()));
        }
        for call in queued {
            let _ = call.tx.send(Err(cause.error()));
        }

        let (reason, exit_code) = match &cause {
            TeardownCause::Exit(code) => ("process exit".to_owned(), *code),
            TeardownCause::Closed(reason) => (reason.clone(), None),
        };
        info!(session_id = %self.session_id, reason, rejected, "connection torn down");
        let _ = self
            .events
            .send(ConnectionEvent::Terminated { reason, exit_code });
    }

    async fn write_line<T: Serialize>(&mut self, value: &T) {
        match serde_json::to_string(value) {
            Ok(line) => {
                // Stream loss is tolerated: outbound messages are not
                // durably queued, so a failed write is a logged no-op.
                if let Err(err) = self.framed_tx.send(line).await {
                    warn!(session_id = %self.session_id, %err, "write to agent stdin failed");
                }
            }
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "failed to serialize outbound message");
            }
        }
    }
}

/// Sleep until `deadline`, or forever when no deadline is armed.
async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
