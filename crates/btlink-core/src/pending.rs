//! Completion accounting for one blocking send.
//!
//! A [`PendingSend`] is created by the send coordinator with a fixed list
//! of targets. Each target resolves exactly once, in two steps: `claim`
//! records the outcome and tells the caller it won, `complete` counts it
//! and wakes the waiter. Between the two the caller updates the registry
//! and fires the error callback, so the sender never wakes before a
//! failure has been reported.

use std::time::{Duration, Instant};

use btlink_types::{PeerAddress, SendOutcome};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::FailureReason;

/// What kind of send a [`PendingSend`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Client write to one peer.
    Unicast,
    /// Client write to every known peer.
    Multicast,
    /// Server notification.
    Notify,
}

/// Final state of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    /// Peer address.
    pub address: PeerAddress,
    /// Terminal outcome, [`SendOutcome::None`] if never resolved.
    pub outcome: SendOutcome,
    /// Why the target failed.
    pub reason: Option<FailureReason>,
}

/// Accounting for a finished send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Kind of send.
    pub mode: SendMode,
    /// Number of targets.
    pub target_count: usize,
    /// Number of targets that reached a terminal outcome.
    pub completed_count: usize,
    /// How many times the completion signal fired (0 or 1).
    pub completion_signals: u32,
    /// Per-target results in dispatch order.
    pub targets: Vec<TargetReport>,
}

impl SendReport {
    /// A report with no targets.
    pub fn empty(mode: SendMode) -> Self {
        Self {
            mode,
            target_count: 0,
            completed_count: 0,
            completion_signals: 0,
            targets: Vec::new(),
        }
    }

    /// Whether every target succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.completed_count == self.target_count
            && self
                .targets
                .iter()
                .all(|t| t.outcome == SendOutcome::Success)
    }

    /// Number of targets that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.outcome == SendOutcome::Success)
            .count()
    }

    /// Targets that did not succeed.
    pub fn failures(&self) -> impl Iterator<Item = &TargetReport> {
        self.targets
            .iter()
            .filter(|t| t.outcome != SendOutcome::Success)
    }

    /// Result for one target.
    pub fn target(&self, address: PeerAddress) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.address == address)
    }
}

#[derive(Debug)]
struct Slot {
    address: PeerAddress,
    outcome: SendOutcome,
    reason: Option<FailureReason>,
    claimed: bool,
    done: bool,
}

#[derive(Debug)]
struct PendingState {
    slots: Vec<Slot>,
    completed: usize,
    signals: u32,
}

/// Completion state shared by a blocked sender and the sessions working
/// on its targets.
#[derive(Debug)]
pub struct PendingSend {
    mode: SendMode,
    payload: Bytes,
    state: Mutex<PendingState>,
    progress: Condvar,
}

impl PendingSend {
    /// Create a send to `targets`. Duplicate addresses are ignored.
    pub fn new(mode: SendMode, payload: Bytes, targets: &[PeerAddress]) -> Self {
        let mut slots: Vec<Slot> = Vec::with_capacity(targets.len());
        for address in targets {
            if slots.iter().any(|s| s.address == *address) {
                continue;
            }
            slots.push(Slot {
                address: *address,
                outcome: SendOutcome::None,
                reason: None,
                claimed: false,
                done: false,
            });
        }
        Self {
            mode,
            payload,
            state: Mutex::new(PendingState {
                slots,
                completed: 0,
                signals: 0,
            }),
            progress: Condvar::new(),
        }
    }

    /// Kind of send.
    pub fn mode(&self) -> SendMode {
        self.mode
    }

    /// The datagram being sent.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of targets.
    pub fn target_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of targets that completed.
    pub fn completed_count(&self) -> usize {
        self.state.lock().completed
    }

    /// Whether every target completed.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.completed == state.slots.len()
    }

    /// Record the outcome for `address`.
    ///
    /// Returns `true` only for the first call per target; later calls and
    /// unknown addresses are ignored.
    pub fn claim(&self, address: PeerAddress, result: Result<(), FailureReason>) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| s.address == address && !s.claimed)
        else {
            return false;
        };
        slot.claimed = true;
        match result {
            Ok(()) => slot.outcome = SendOutcome::Success,
            Err(reason) => {
                slot.outcome = SendOutcome::Failed;
                slot.reason = Some(reason);
            }
        }
        true
    }

    /// Count a claimed target and wake the waiter.
    ///
    /// The completion signal fires once, when the last target completes.
    pub fn complete(&self, address: PeerAddress) {
        let mut state = self.state.lock();
        let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| s.address == address && s.claimed && !s.done)
        else {
            return;
        };
        slot.done = true;
        state.completed += 1;
        if state.completed == state.slots.len() && state.signals == 0 {
            state.signals = 1;
        }
        self.progress.notify_all();
    }

    /// Targets that have not been claimed yet.
    pub fn unresolved(&self) -> Vec<PeerAddress> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| !s.claimed)
            .map(|s| s.address)
            .collect()
    }

    /// Block until the completed count differs from `seen` or `timeout`
    /// passes. Returns the current completed count.
    pub fn wait_progress(&self, seen: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.completed == seen && state.completed < state.slots.len() {
            if self.progress.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.completed
    }

    /// Wake the waiter without changing any state.
    pub fn wake(&self) {
        self.progress.notify_all();
    }

    /// Reason of the first failed target in dispatch order.
    pub fn first_failure(&self) -> Option<FailureReason> {
        self.state
            .lock()
            .slots
            .iter()
            .find_map(|s| s.reason.clone())
    }

    /// Snapshot of the accounting.
    pub fn report(&self) -> SendReport {
        let state = self.state.lock();
        SendReport {
            mode: self.mode,
            target_count: state.slots.len(),
            completed_count: state.completed,
            completion_signals: state.signals,
            targets: state
                .slots
                .iter()
                .map(|s| TargetReport {
                    address: s.address,
                    outcome: s.outcome,
                    reason: s.reason.clone(),
                })
                .collect(),
        }
    }
}
