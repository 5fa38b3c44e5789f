//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Engine error enumeration covering all failure modes of a hosted-agent
/// connection.
///
/// The taxonomy follows the connection lifecycle: startup failures are fatal
/// to the connection and surfaced once; per-call timeouts reject only the
/// affected call; remote errors carry the peer's JSON-RPC error payload;
/// process-exit failures reject every outstanding call and mark the
/// connection dead.
#[derive(Debug)]
pub enum RpcError {
    /// Child process failed to spawn or exited during the startup grace
    /// window.
    Startup(String),
    /// An outbound call expired before a matching response arrived.
    Timeout {
        /// Method of the expired call.
        method: String,
        /// Wall-clock seconds between issuing the call and expiry.
        elapsed_secs: u64,
    },
    /// The initialize handshake did not complete within its own window.
    InitializeTimeout,
    /// The peer returned an `error` member in a response envelope.
    Remote {
        /// JSON-RPC error code reported by the peer.
        code: i64,
        /// Human-readable message reported by the peer.
        message: String,
    },
    /// The child process exited while calls were outstanding.
    ProcessExit {
        /// Exit code, when the process was not killed by a signal.
        code: Option<i32>,
    },
    /// The connection was torn down before the call could complete.
    Closed(String),
    /// The flow-control gate's outbound queue is at capacity.
    QueueFull(String),
    /// An elicitation decision was delivered for an unknown or
    /// already-consumed call identifier.
    AlreadyResolved(String),
    /// Malformed envelope or an otherwise unusable protocol payload.
    Protocol(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup(msg) => write!(f, "startup: {msg}"),
            Self::Timeout {
                method,
                elapsed_secs,
            } => write!(
                f,
                "timeout: `{method}` got no response after {elapsed_secs}s"
            ),
            Self::InitializeTimeout => {
                write!(f, "timeout: initialize handshake did not complete")
            }
            Self::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            Self::ProcessExit { code } => match code {
                Some(c) => write!(f, "agent process exited with code {c}"),
                None => write!(f, "agent process terminated by signal"),
            },
            Self::Closed(msg) => write!(f, "connection closed: {msg}"),
            Self::QueueFull(msg) => write!(f, "outbound queue full: {msg}"),
            Self::AlreadyResolved(msg) => write!(f, "already resolved: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        Self::Protocol(format!("invalid config: {err}"))
    }
}

impl RpcError {
    /// JSON-RPC error code used when this error is written back to the peer
    /// as a response envelope.
    #[must_use]
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::Remote { code, .. } => *code,
            Self::Protocol(_) => -32602,
            _ => -32603,
        }
    }
}
