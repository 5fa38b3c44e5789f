//! Agent process spawner.
//!
//! Launches agent CLI processes with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + the caller's resolved environment, so host secrets are
//!   never visible to the child.
//! - All three stdio streams piped; stderr is drained into a bounded tail
//!   buffer used to classify startup failures.
//! - A post-spawn grace window: a process that exits within it is reported
//!   as a startup failure with a diagnosis, not as a broken connection.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::config::SpawnConfig;
use crate::{Result, RpcError};

/// Lines of stderr retained for failure diagnosis.
const STDERR_TAIL_LINES: usize = 40;

// ── Stderr tail ──────────────────────────────────────────────────────────────

/// Bounded ring of the most recent stderr lines from one child process.
///
/// Shared between the drain task and the exit monitor; a snapshot taken at
/// exit time is matched against the failure patterns.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// Join the retained lines into one newline-separated string.
    #[must_use]
    pub fn snapshot(&self) -> String {
        self.lines.lock().map_or_else(
            |_| String::new(),
            |lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"),
        )
    }
}

// ── Failure classification ───────────────────────────────────────────────────

fn failure_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"(?i)command not found|no such file or directory|not recognized as",
                "agent binary not found",
            ),
            (r"(?i)permission denied", "agent binary is not executable"),
            (
                r"(?i)not logged in|invalid api key|api key not|unauthorized|please run .*login|authentication (failed|required)",
                "agent requires authentication",
            ),
            (
                r"(?i)unknown (option|argument|flag)|unexpected argument|invalid (option|argument|flag)",
                "agent rejected its arguments",
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, label)))
        .collect()
    })
}

/// Map a stderr snapshot to a failure diagnosis, if any pattern matches.
#[must_use]
pub fn classify_stderr(stderr: &str) -> Option<&'static str> {
    failure_patterns()
        .iter()
        .find(|(re, _)| re.is_match(stderr))
        .map(|(_, label)| *label)
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// A live agent process with its piped streams.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child handle; kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Child's stdin, for the connection's outbound frames.
    pub stdin: ChildStdin,
    /// Child's stdout, for the connection's inbound frames.
    pub stdout: ChildStdout,
    /// Shared tail of recent stderr output.
    pub stderr_tail: StderrTail,
}

/// Spawn an agent process and confirm it survives the startup grace window.
///
/// The parent environment is cleared; the child sees exactly `config.env`.
/// A process that exits inside the grace window has its stderr tail
/// classified and a [`RpcError::Startup`] returned instead of a process
/// handle.
///
/// # Errors
///
/// Returns [`RpcError::Startup`] on OS spawn failure, missing stdio pipes,
/// or exit during the grace window.
pub async fn spawn_process(config: &SpawnConfig) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.cwd)
        .env_clear()
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        RpcError::Startup(format!("failed to spawn `{}`: {err}", config.command))
    })?;
    info!(command = %config.command, pid = child.id(), "agent process spawned");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RpcError::Startup("child stdin was not piped".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RpcError::Startup("child stdout was not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RpcError::Startup("child stderr was not piped".into()))?;

    let stderr_tail = StderrTail::default();
    let tail = stderr_tail.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stderr = %line, "agent stderr");
            tail.push(line);
        }
    });

    // An immediate exit (bad binary, auth failure, bad args) surfaces here
    // as one startup error rather than as a dead connection later.
    tokio::time::sleep(config.startup_grace()).await;
    if let Some(status) = child
        .try_wait()
        .map_err(|err| RpcError::Startup(format!("failed to poll child: {err}")))?
    {
        let snapshot = stderr_tail.snapshot();
        let diagnosis = classify_stderr(&snapshot).unwrap_or("agent exited during startup");
        return Err(RpcError::Startup(format!(
            "{diagnosis} ({status}): {snapshot}"
        )));
    }

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        stderr_tail,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
