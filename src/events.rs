//! Events emitted by a connection for host-side handling.

use serde_json::Value;

/// Events delivered to the host over a connection's event channel.
///
/// The engine resolves calls through their returned futures; everything the
/// host needs to *observe* (peer notifications, approval waits, turn
/// completion, teardown) arrives here instead.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The peer sent a notification. Liveness signals are also forwarded
    /// here after their deadline-reset side effect has been applied.
    Notification {
        /// Notification method name.
        method: String,
        /// Raw params payload.
        params: Value,
    },
    /// An elicitation request arrived and the connection is now globally
    /// paused awaiting [`RpcHandle::resolve_decision`](crate::rpc::RpcHandle::resolve_decision).
    DecisionRequested {
        /// Opaque external call identifier carried by the request.
        call_id: String,
        /// Method of the eliciting request.
        method: String,
        /// Raw params payload for UI rendering.
        params: Value,
    },
    /// A response carried the end-of-turn marker.
    TurnCompleted {
        /// Value of the configured end-of-turn marker field.
        stop_reason: Value,
    },
    /// The connection was torn down.
    Terminated {
        /// Human-readable reason.
        reason: String,
        /// Exit code when teardown was caused by process exit.
        exit_code: Option<i32>,
    },
}
