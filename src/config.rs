//! Engine configuration parsing, validation, and duration policy.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{Result, RpcError};

/// Per-method timeout policy for outbound calls.
///
/// A small fixed set of "interactive" methods (the ones that trigger model
/// inference) get a long duration; every other method gets the short default.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CallTimeouts {
    /// Default duration for ordinary calls, in seconds.
    #[serde(default = "default_call_seconds")]
    pub default_seconds: u64,
    /// Duration for long-running (inference-triggering) calls, in seconds.
    #[serde(default = "default_long_running_seconds")]
    pub long_running_seconds: u64,
    /// Methods that receive the long-running duration.
    #[serde(default = "default_long_running_methods")]
    pub long_running_methods: Vec<String>,
}

fn default_call_seconds() -> u64 {
    60
}

fn default_long_running_seconds() -> u64 {
    1200
}

fn default_long_running_methods() -> Vec<String> {
    vec!["session/prompt".into()]
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            default_seconds: default_call_seconds(),
            long_running_seconds: default_long_running_seconds(),
            long_running_methods: default_long_running_methods(),
        }
    }
}

impl CallTimeouts {
    /// Whether `method` belongs to the long-running set.
    #[must_use]
    pub fn is_long_running(&self, method: &str) -> bool {
        self.long_running_methods.iter().any(|m| m == method)
    }

    /// Configured duration for `method`.
    #[must_use]
    pub fn duration_for(&self, method: &str) -> Duration {
        if self.is_long_running(method) {
            Duration::from_secs(self.long_running_seconds)
        } else {
            Duration::from_secs(self.default_seconds)
        }
    }
}

/// Which flow-control policy the peer's protocol requires around a human
/// approval step.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlMode {
    /// Pause the timers of in-flight long-running calls while an approval
    /// handler runs, resume them afterwards.
    PauseTimers,
    /// Suspend all new outbound sends while an elicitation is outstanding,
    /// queue them, and flush in FIFO order on resume.
    QueueOutbound,
}

/// Flow-control gate configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GateConfig {
    /// Gate policy for this connection's protocol variant.
    #[serde(default = "default_mode")]
    pub mode: FlowControlMode,
    /// Inbound request methods that require a human decision under the
    /// [`FlowControlMode::PauseTimers`] policy.
    #[serde(default = "default_approval_methods")]
    pub approval_methods: Vec<String>,
    /// Inbound request method that opens the global pause under
    /// [`FlowControlMode::QueueOutbound`].
    #[serde(default = "default_elicitation_method")]
    pub elicitation_method: String,
    /// Params field carrying the opaque external call identifier of an
    /// elicitation request.
    #[serde(default = "default_call_id_param")]
    pub call_id_param: String,
    /// Ceiling on how long an approval handler may run before the engine
    /// answers with [`Self::denial_response`], in seconds.
    #[serde(default = "default_decision_ceiling")]
    pub decision_ceiling_seconds: u64,
    /// Response body written when the approval wait exceeds the ceiling.
    #[serde(default = "default_denial_response")]
    pub denial_response: serde_json::Value,
    /// Cap on the outbound queue while globally paused. Calls beyond the
    /// cap are rejected rather than buffered without bound.
    #[serde(default = "default_max_queued_calls")]
    pub max_queued_calls: usize,
}

fn default_mode() -> FlowControlMode {
    FlowControlMode::PauseTimers
}

fn default_approval_methods() -> Vec<String> {
    vec!["session/request_permission".into()]
}

fn default_elicitation_method() -> String {
    "elicitation/create".into()
}

fn default_call_id_param() -> String {
    "callId".into()
}

fn default_decision_ceiling() -> u64 {
    30
}

fn default_denial_response() -> serde_json::Value {
    serde_json::json!({ "behavior": "deny" })
}

fn default_max_queued_calls() -> usize {
    64
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            approval_methods: default_approval_methods(),
            elicitation_method: default_elicitation_method(),
            call_id_param: default_call_id_param(),
            decision_ceiling_seconds: default_decision_ceiling(),
            denial_response: default_denial_response(),
            max_queued_calls: default_max_queued_calls(),
        }
    }
}

/// Initialize handshake configuration.
///
/// The handshake is the first outbound call on a fresh connection and has
/// its own timeout, distinct from steady-state per-call durations.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HandshakeConfig {
    /// Method name of the handshake call.
    #[serde(default = "default_handshake_method")]
    pub method: String,
    /// Params sent with the handshake call; `null` omits the field.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Handshake timeout, in seconds.
    #[serde(default = "default_handshake_seconds")]
    pub timeout_seconds: u64,
}

fn default_handshake_method() -> String {
    "initialize".into()
}

fn default_handshake_seconds() -> u64 {
    10
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            method: default_handshake_method(),
            params: serde_json::Value::Null,
            timeout_seconds: default_handshake_seconds(),
        }
    }
}

/// Engine configuration parsed from `conduit.toml` (or built in code).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Outbound call duration policy.
    #[serde(default)]
    pub timeouts: CallTimeouts,
    /// Flow-control gate policy and parameters.
    #[serde(default)]
    pub gate: GateConfig,
    /// Initialize handshake parameters.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Notification methods treated as liveness signals: observing one
    /// re-arms every armed long-running call with its full duration.
    #[serde(default = "default_liveness_methods")]
    pub liveness_methods: Vec<String>,
    /// Result field whose presence marks a response as ending the agent's
    /// turn, firing a side-channel completion event.
    #[serde(default = "default_end_turn_marker")]
    pub end_turn_marker: String,
    /// Maximum concurrent agent sessions managed by a registry.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
}

fn default_liveness_methods() -> Vec<String> {
    vec!["session/update".into()]
}

fn default_end_turn_marker() -> String {
    "stopReason".into()
}

fn default_max_concurrent_sessions() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: CallTimeouts::default(),
            gate: GateConfig::default(),
            handshake: HandshakeConfig::default(),
            liveness_methods: default_liveness_methods(),
            end_turn_marker: default_end_turn_marker(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| RpcError::Protocol(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Ceiling on the approval handler wait.
    #[must_use]
    pub fn decision_ceiling(&self) -> Duration {
        Duration::from_secs(self.gate.decision_ceiling_seconds)
    }

    /// Handshake timeout window.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake.timeout_seconds)
    }

    /// Whether `method` is a liveness-signal notification.
    #[must_use]
    pub fn is_liveness_signal(&self, method: &str) -> bool {
        self.liveness_methods.iter().any(|m| m == method)
    }

    fn validate(&self) -> Result<()> {
        if self.gate.max_queued_calls == 0 {
            return Err(RpcError::Protocol(
                "gate.max_queued_calls must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(RpcError::Protocol(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }
        if self.timeouts.default_seconds == 0 || self.timeouts.long_running_seconds == 0 {
            return Err(RpcError::Protocol(
                "call timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Resolved spawn tuple for one agent process.
///
/// Argument construction and environment shaping per CLI flavor are owned by
/// the caller; the engine only needs the resolved command line.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpawnConfig {
    /// Agent CLI binary (e.g., `claude`, `gemini`).
    pub command: String,
    /// Arguments passed to the binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child process.
    pub cwd: PathBuf,
    /// Environment for the child; the parent environment is cleared first.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Grace window after spawn used to confirm the process did not exit
    /// immediately, in milliseconds.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Grace period before force-killing the child on stop, in seconds.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
}

fn default_startup_grace_ms() -> u64 {
    500
}

fn default_stop_grace_seconds() -> u64 {
    5
}

impl SpawnConfig {
    /// Create a spawn config with defaults for the grace windows.
    #[must_use]
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            startup_grace_ms: default_startup_grace_ms(),
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }

    /// Add an argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Startup grace window.
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Stop grace period.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}
