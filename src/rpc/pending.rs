//! Correlation table and per-call timeout bookkeeping.
//!
//! Maps each outbound correlation id to a [`PendingCall`] record. The table
//! is owned exclusively by the connection actor; deadlines are plain
//! `Instant`s and the actor sleeps until the earliest one, so pausing a call
//! genuinely stops its clock instead of merely suppressing a callback.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::RpcError;

/// One outstanding outbound call.
///
/// Invariant: `deadline` is `Some` iff the call is armed and `None` iff it
/// is paused; an entry is never both, and never neither while outstanding.
#[derive(Debug)]
pub(crate) struct PendingCall {
    /// RPC method name; determines the configured duration.
    pub method: String,
    /// Completion channel; consumed exactly once.
    pub tx: oneshot::Sender<Result<Value, RpcError>>,
    /// When the call was first issued, for elapsed-time error text.
    pub issued_at: Instant,
    /// Full configured duration, used by deadline resets.
    pub duration: Duration,
    /// Budget still available as of the last arm/pause transition.
    pub remaining: Duration,
    /// Expiry instant while armed; `None` while paused.
    pub deadline: Option<Instant>,
}

impl PendingCall {
    fn new(
        method: String,
        tx: oneshot::Sender<Result<Value, RpcError>>,
        duration: Duration,
        issued_at: Instant,
        deadline: Instant,
    ) -> Self {
        let remaining = deadline.saturating_duration_since(issued_at);
        Self {
            method,
            tx,
            issued_at,
            duration,
            remaining,
            deadline: Some(deadline),
        }
    }

    /// Whether the entry's clock is currently stopped.
    pub fn is_paused(&self) -> bool {
        self.deadline.is_none()
    }

    /// Seconds since the call was issued.
    pub fn elapsed_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.issued_at).as_secs()
    }

    /// Build the timeout error for this entry.
    pub fn timeout_error(&self, now: Instant) -> RpcError {
        RpcError::Timeout {
            method: self.method.clone(),
            elapsed_secs: self.elapsed_secs(now),
        }
    }
}

/// Outcome of [`PendingTable::resume`].
pub(crate) enum ResumeOutcome {
    /// The entry's timer was re-armed with its remaining budget.
    Rearmed,
    /// The budget was already exhausted; the removed entry must be rejected
    /// with a timeout error instead of being re-armed.
    Expired(PendingCall),
    /// No paused entry exists under this id.
    NotPaused,
}

/// The correlation table: outbound id → pending call.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    next_id: u64,
    entries: HashMap<u64, PendingCall>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation id. Ids are monotonically assigned per
    /// connection and never reused while outstanding.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a freshly issued call under `id`, armed for `duration`.
    pub fn register(
        &mut self,
        id: u64,
        method: String,
        tx: oneshot::Sender<Result<Value, RpcError>>,
        duration: Duration,
        now: Instant,
    ) {
        self.entries.insert(
            id,
            PendingCall::new(method, tx, duration, now, now + duration),
        );
    }

    /// Register a call flushed from the outbound queue, preserving the
    /// deadline it was given when enqueued (the timeout clock keeps running
    /// while a call waits in the queue).
    pub fn register_with_deadline(
        &mut self,
        id: u64,
        method: String,
        tx: oneshot::Sender<Result<Value, RpcError>>,
        duration: Duration,
        issued_at: Instant,
        deadline: Instant,
        now: Instant,
    ) {
        let mut entry = PendingCall::new(method, tx, duration, issued_at, deadline);
        entry.remaining = deadline.saturating_duration_since(now);
        self.entries.insert(id, entry);
    }

    /// Remove and return the entry for `id`, disarming its timer.
    pub fn complete(&mut self, id: u64) -> Option<PendingCall> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop the clock of an armed entry. Returns `false` for missing or
    /// already-paused entries.
    pub fn pause(&mut self, id: u64, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => match entry.deadline.take() {
                Some(deadline) => {
                    entry.remaining = deadline.saturating_duration_since(now);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Re-arm a paused entry with its remaining budget.
    ///
    /// If the budget is already exhausted the entry is removed and returned
    /// so the caller can reject it immediately rather than letting it hang.
    pub fn resume(&mut self, id: u64, now: Instant) -> ResumeOutcome {
        let Some(entry) = self.entries.get_mut(&id) else {
            return ResumeOutcome::NotPaused;
        };
        if !entry.is_paused() {
            return ResumeOutcome::NotPaused;
        }
        if entry.remaining.is_zero() {
            return match self.entries.remove(&id) {
                Some(expired) => ResumeOutcome::Expired(expired),
                None => ResumeOutcome::NotPaused,
            };
        }
        entry.deadline = Some(now + entry.remaining);
        ResumeOutcome::Rearmed
    }

    /// Re-arm an armed entry with its full original duration from `now`.
    ///
    /// Paused entries are left untouched; a liveness signal observed while
    /// the world is paused must not silently re-arm anything.
    pub fn reset_deadline(&mut self, id: u64, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if !entry.is_paused() => {
                entry.issued_at = now;
                entry.remaining = entry.duration;
                entry.deadline = Some(now + entry.duration);
                true
            }
            _ => false,
        }
    }

    /// Pause every armed entry whose method matches `pred`. Returns how
    /// many entries transitioned.
    pub fn pause_matching(&mut self, pred: impl Fn(&str) -> bool, now: Instant) -> usize {
        let mut paused = 0;
        for entry in self.entries.values_mut() {
            if pred(&entry.method) {
                if let Some(deadline) = entry.deadline.take() {
                    entry.remaining = deadline.saturating_duration_since(now);
                    paused += 1;
                }
            }
        }
        paused
    }

    /// Resume every paused entry whose method matches `pred`. Entries whose
    /// budget expired while paused are removed and returned for rejection.
    pub fn resume_matching(
        &mut self,
        pred: impl Fn(&str) -> bool,
        now: Instant,
    ) -> Vec<(u64, PendingCall)> {
        let mut expired_ids = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.is_paused() && pred(&entry.method) {
                if entry.remaining.is_zero() {
                    expired_ids.push(*id);
                } else {
                    entry.deadline = Some(now + entry.remaining);
                }
            }
        }
        expired_ids
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Reset the deadline of every armed entry whose method matches `pred`.
    pub fn reset_matching(&mut self, pred: impl Fn(&str) -> bool, now: Instant) -> usize {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_paused() && pred(&e.method))
            .map(|(id, _)| *id)
            .collect();
        let mut reset = 0;
        for id in ids {
            if self.reset_deadline(id, now) {
                reset += 1;
            }
        }
        reset
    }

    /// Earliest armed deadline across the table.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Remove and return every armed entry whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<(u64, PendingCall)> {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    /// Remove every entry (armed or paused) for connection teardown.
    pub fn drain(&mut self) -> Vec<(u64, PendingCall)> {
        self.entries.drain().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
