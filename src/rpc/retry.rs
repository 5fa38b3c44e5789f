//! Bounded retry for transient upstream failures.
//!
//! Agent CLIs surface provider-side trouble (rate limits, resets, gateway
//! errors) as JSON-RPC error responses. Those are worth one or two more
//! attempts with a fixed pause; everything else fails fast.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::rpc::RpcHandle;
use crate::{Result, RpcError};

/// Message fragments that identify a remote error as transient.
const NETWORK_ERROR_PHRASES: &[&str] = &[
    "connection refused",
    "connection reset",
    "network is unreachable",
    "temporarily unavailable",
    "rate limit",
    "overloaded",
    "timed out",
    "503",
    "529",
];

/// Whether `err` is a transient upstream failure worth retrying.
///
/// Only remote errors qualify; local timeouts, queue rejections, and
/// teardown errors are never retried because the retried call would hit the
/// same dead connection or exhausted budget.
#[must_use]
pub fn is_network_error(err: &RpcError) -> bool {
    match err {
        RpcError::Remote { message, .. } => {
            let lowered = message.to_ascii_lowercase();
            NETWORK_ERROR_PHRASES.iter().any(|p| lowered.contains(p))
        }
        _ => false,
    }
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Issue `method` through `handle`, retrying transient remote failures up to
/// the policy's attempt cap.
///
/// # Errors
///
/// Propagates the final attempt's error, or the first non-transient error
/// encountered.
pub async fn call_with_retry(
    handle: &RpcHandle,
    method: &str,
    params: Option<Value>,
    policy: RetryPolicy,
) -> Result<Value> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match handle.call(method, params.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_network_error(&err) => {
                warn!(method, attempt, %err, "transient agent failure, retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
