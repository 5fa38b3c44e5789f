//! Exit monitor: detects agent process termination and stops it on demand.
//!
//! One monitor task per session awaits the child's exit and reports it to
//! the connection actor, which rejects all outstanding calls with a
//! process-exit error. Cancelling the token instead runs the graceful-stop
//! path: wait out the stop grace period, then force-kill.

use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::rpc::RpcHandle;
use crate::supervise::spawner::{classify_stderr, StderrTail};

/// Spawn the exit monitor for one agent process.
#[must_use]
pub fn spawn_exit_monitor(
    session_id: String,
    mut child: Child,
    handle: RpcHandle,
    stderr_tail: StderrTail,
    stop_grace: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        let code = status.code();
                        let snapshot = stderr_tail.snapshot();
                        let reason = classify_stderr(&snapshot)
                            .map_or_else(|| format!("process exited ({status})"), str::to_owned);
                        warn!(session_id, ?code, reason, "agent process exited");
                        handle.process_exited(code, reason).await;
                    }
                    Err(err) => {
                        warn!(session_id, %err, "failed to await agent process");
                        handle.process_exited(None, format!("wait failed: {err}")).await;
                    }
                }
            }
            () = cancel.cancelled() => {
                info!(session_id, "stopping agent process");
                // Closing stdin (via connection teardown) usually suffices;
                // force-kill only after the grace period.
                match tokio::time::timeout(stop_grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(session_id, %status, "agent process stopped");
                    }
                    Ok(Err(err)) => {
                        warn!(session_id, %err, "failed to await agent process");
                    }
                    Err(_) => {
                        warn!(session_id, "agent ignored stop, killing");
                        if let Err(err) = child.kill().await {
                            warn!(session_id, %err, "failed to kill agent process");
                        }
                    }
                }
            }
        }
    })
}
