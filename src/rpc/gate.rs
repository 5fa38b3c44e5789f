//! Flow-control gate state: elicitation mappings and the outbound queue.
//!
//! Under the global-pause policy, an inbound approval-required request maps
//! its opaque external call id to the peer's RPC id and closes the gate.
//! While closed, outbound calls are buffered (with their timeout clocks
//! running) instead of written; delivering the human decision writes the
//! mapped response, and once no mappings remain the queue is flushed in
//! FIFO order with freshly allocated correlation ids.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{Result, RpcError};

/// One outbound call buffered while the gate is closed.
#[derive(Debug)]
pub(crate) struct QueuedCall {
    /// RPC method name.
    pub method: String,
    /// Params payload.
    pub params: Option<Value>,
    /// Completion channel, carried into the correlation table on flush.
    pub tx: oneshot::Sender<std::result::Result<Value, RpcError>>,
    /// When the call was issued; queueing does not reset this.
    pub issued_at: Instant,
    /// Full configured duration.
    pub duration: std::time::Duration,
    /// Expiry instant; the clock runs even while queued.
    pub deadline: Instant,
}

/// Gate state owned by the connection actor.
#[derive(Debug)]
pub(crate) struct FlowGate {
    paused: bool,
    elicitations: HashMap<String, u64>,
    queue: VecDeque<QueuedCall>,
    max_queued: usize,
}

impl FlowGate {
    pub fn new(max_queued: usize) -> Self {
        Self {
            paused: false,
            elicitations: HashMap::new(),
            queue: VecDeque::new(),
            max_queued,
        }
    }

    /// Whether outbound sends are currently suspended.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Record `call_id → request_id` and close the gate.
    ///
    /// A second elicitation arriving while already paused records its own
    /// mapping; each is resolved independently.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] if `call_id` is already mapped — an
    /// identifier must not be reused while awaiting a decision.
    pub fn record_elicitation(&mut self, call_id: String, request_id: u64) -> Result<()> {
        if self.elicitations.contains_key(&call_id) {
            return Err(RpcError::Protocol(format!(
                "elicitation call id `{call_id}` is already awaiting a decision"
            )));
        }
        self.elicitations.insert(call_id, request_id);
        self.paused = true;
        Ok(())
    }

    /// Consume the mapping for `call_id`, returning the RPC id to answer.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::AlreadyResolved`] for unknown or already-consumed
    /// identifiers; resolving twice must not produce a duplicate write.
    pub fn take_elicitation(&mut self, call_id: &str) -> Result<u64> {
        self.elicitations
            .remove(call_id)
            .ok_or_else(|| RpcError::AlreadyResolved(format!("elicitation call id `{call_id}`")))
    }

    /// Buffer an outbound call while the gate is closed.
    ///
    /// # Errors
    ///
    /// Returns the call back inside [`RpcError::QueueFull`]'s rejection path
    /// when the bounded queue is at capacity.
    pub fn enqueue(&mut self, call: QueuedCall) -> std::result::Result<(), QueuedCall> {
        if self.queue.len() >= self.max_queued {
            return Err(call);
        }
        self.queue.push_back(call);
        Ok(())
    }

    /// Reopen the gate if no elicitations remain, handing back the buffered
    /// calls in enqueue order for flushing. Returns an empty vec while other
    /// decisions are still outstanding.
    pub fn reopen_if_idle(&mut self) -> Vec<QueuedCall> {
        if !self.elicitations.is_empty() {
            return Vec::new();
        }
        self.paused = false;
        self.queue.drain(..).collect()
    }

    /// Earliest deadline among queued calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().map(|c| c.deadline).min()
    }

    /// Remove and return queued calls whose deadline has passed. The
    /// timeout clock bounds total wait even when a decision never arrives.
    pub fn expired(&mut self, now: Instant) -> Vec<QueuedCall> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for call in self.queue.drain(..) {
            if call.deadline <= now {
                expired.push(call);
            } else {
                kept.push_back(call);
            }
        }
        self.queue = kept;
        expired
    }

    /// Clear all gate state for teardown, returning buffered calls so the
    /// caller can reject them.
    pub fn clear(&mut self) -> Vec<QueuedCall> {
        self.paused = false;
        self.elicitations.clear();
        self.queue.drain(..).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
