//! Blocking unicast and multicast sends.
//!
//! The coordinator locates targets, hands jobs to the session driver and
//! blocks the caller on the [`PendingSend`] until every target resolved.
//! Waits are sliced by `wait_slice` so cancellation, shutdown and the
//! session watchdog are checked while blocked. Scanning is resumed before
//! every return.

use std::sync::Arc;
use std::time::{Duration, Instant};

use btlink_types::{DiscoveredPeer, PeerAddress, SendOutcome, TransportKind};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::AdapterContext;
use crate::error::{Error, FailureReason, Result};
use crate::pending::{PendingSend, SendMode, SendReport};
use crate::retry::with_retry;
use crate::session::Job;

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitEnd {
    Ready,
    TimedOut,
    Cancelled,
    Stopped,
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.is_some_and(CancellationToken::is_cancelled)
}

impl AdapterContext {
    pub(crate) fn check_payload(&self, payload: &Bytes) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::invalid_parameter("payload is empty"));
        }
        let max = self.config.max_payload();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        Ok(())
    }

    fn ensure_client(&self) -> Result<()> {
        self.ensure_started()?;
        if !self.config.client {
            return Err(Error::invalid_parameter("client role is not enabled"));
        }
        Ok(())
    }

    /// Why a blocked send gave up, if it did.
    fn interrupted(&self, cancel: Option<&CancellationToken>) -> Option<FailureReason> {
        if is_cancelled(cancel) {
            Some(FailureReason::Cancelled)
        } else if !self.is_started() {
            Some(FailureReason::AdapterStopped)
        } else {
            None
        }
    }

    /// Wait for the discovery list to satisfy `ready`, in
    /// `discovery_retries` rounds of `discovery_wait`. `settled` is checked
    /// between slices outside the discovery lock.
    pub(crate) fn wait_for_discovery(
        &self,
        cancel: Option<&CancellationToken>,
        ready: impl Fn(&[DiscoveredPeer]) -> bool,
        settled: impl Fn() -> bool,
    ) -> WaitEnd {
        let slice = self.config.wait_slice;
        for round in 0..self.config.discovery_retries {
            let deadline = Instant::now() + self.config.discovery_wait;
            loop {
                if let Some(reason) = self.interrupted(cancel) {
                    return match reason {
                        FailureReason::Cancelled => WaitEnd::Cancelled,
                        _ => WaitEnd::Stopped,
                    };
                }
                if settled() {
                    return WaitEnd::Ready;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if self.discovery.wait_until(remaining.min(slice), &ready) {
                    return WaitEnd::Ready;
                }
            }
            debug!(
                "Discovery wait {}/{} elapsed",
                round + 1,
                self.config.discovery_retries
            );
        }
        WaitEnd::TimedOut
    }

    /// Block until `pending` completes, resolving what is left if the
    /// caller cancels or the adapter stops. `dispatch` runs before every
    /// wait slice.
    fn wait_pending(
        self: &Arc<Self>,
        pending: &Arc<PendingSend>,
        cancel: Option<&CancellationToken>,
        mut dispatch: impl FnMut(usize),
    ) {
        let slice = self.config.wait_slice;
        let mut seen = pending.completed_count();
        loop {
            dispatch(pending.completed_count());
            if pending.is_complete() {
                return;
            }
            if let Some(reason) = self.interrupted(cancel) {
                debug!("Abandoning {} unresolved targets: {}", pending.unresolved().len(), reason);
                for address in pending.unresolved() {
                    self.finish_target(pending, address, Err(reason.clone()));
                }
                return;
            }
            self.expire_stalled();
            seen = pending.wait_progress(seen, slice);
        }
    }

    /// Sleep between retries. Returns `false` if the send should give up.
    fn backoff(&self, delay: Duration, cancel: Option<&CancellationToken>) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.interrupted(cancel).is_some() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(remaining.min(self.config.wait_slice));
        }
    }

    fn transport_for(&self, address: PeerAddress) -> TransportKind {
        self.discovery
            .get(address)
            .map(|p| p.transport)
            .or_else(|| self.registry.get(address).map(|s| s.transport))
            .unwrap_or_default()
    }

    fn dispatch(self: &Arc<Self>, pending: &Arc<PendingSend>, address: PeerAddress) {
        match Job::new(Arc::clone(pending), self.config.mtu) {
            Ok(job) => self.submit_job(address, self.transport_for(address), job),
            Err(e) => self.finish_target(pending, address, Err(FailureReason::Platform(e.to_string()))),
        }
    }

    fn conclude(pending: &PendingSend) -> Result<SendReport> {
        let report = pending.report();
        if report.is_success() {
            return Ok(report);
        }
        let reason = pending
            .first_failure()
            .unwrap_or(FailureReason::Platform("send left unresolved".into()));
        Err(Error::SendFailed { reason, report })
    }

    pub(crate) fn send_unicast(
        self: &Arc<Self>,
        address: PeerAddress,
        payload: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<SendReport> {
        self.ensure_client()?;
        self.check_payload(&payload)?;
        with_retry(
            &self.config.retry,
            "send_unicast",
            |_| self.unicast_once(address, payload.clone(), cancel),
            |delay| self.backoff(delay, cancel),
        )
    }

    fn unicast_once(
        self: &Arc<Self>,
        address: PeerAddress,
        payload: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<SendReport> {
        let pending = Arc::new(PendingSend::new(SendMode::Unicast, payload, &[address]));
        self.track(&pending);
        self.registry
            .update(address, |s| s.last_send_outcome = SendOutcome::None);

        if self.client_peers.contains(address) {
            self.dispatch(&pending, address);
        } else {
            if !self.discovery.contains(address) {
                debug!("Waiting for {} to be discovered", address);
                self.resume_scan();
            }
            // A concurrent send may already have taken the peer off the
            // discovery list to connect it.
            let end = self.wait_for_discovery(
                cancel,
                |peers| peers.iter().any(|p| p.address == address),
                || self.client_peers.contains(address) || self.has_session(address),
            );
            match end {
                WaitEnd::Ready => self.dispatch(&pending, address),
                WaitEnd::TimedOut => {
                    info!("{} not found after {:?}", address, self.config.discovery_budget());
                    self.finish_target(&pending, address, Err(FailureReason::PeerNotFound));
                }
                WaitEnd::Cancelled => {
                    self.finish_target(&pending, address, Err(FailureReason::Cancelled));
                }
                WaitEnd::Stopped => {
                    self.finish_target(&pending, address, Err(FailureReason::AdapterStopped));
                }
            }
        }

        self.wait_pending(&pending, cancel, |_| {});
        self.resume_scan();
        self.untrack(&pending);
        Self::conclude(&pending)
    }

    /// Known peers: discovered first, then connected, without duplicates.
    fn known_peers(&self) -> Vec<PeerAddress> {
        let mut peers: Vec<PeerAddress> = self
            .discovery
            .snapshot()
            .into_iter()
            .map(|p| p.address)
            .collect();
        for address in self.client_peers.snapshot() {
            if !peers.contains(&address) {
                peers.push(address);
            }
        }
        peers
    }

    pub(crate) fn send_multicast(
        self: &Arc<Self>,
        payload: Bytes,
        cancel: Option<&CancellationToken>,
    ) -> Result<SendReport> {
        self.ensure_client()?;
        self.check_payload(&payload)?;

        let mut targets = self.known_peers();
        if targets.is_empty() {
            debug!("No peers known, waiting for discovery");
            self.resume_scan();
            let end = self.wait_for_discovery(
                cancel,
                |peers| !peers.is_empty(),
                || !self.client_peers.is_empty(),
            );
            targets = self.known_peers();
            if targets.is_empty() {
                let reason = match end {
                    WaitEnd::Cancelled => FailureReason::Cancelled,
                    WaitEnd::Stopped => FailureReason::AdapterStopped,
                    WaitEnd::Ready | WaitEnd::TimedOut => FailureReason::NoPeersDiscovered,
                };
                warn!("Multicast abandoned: {}", reason);
                self.report_failure(None, payload, reason.clone());
                self.resume_scan();
                return Err(Error::SendFailed {
                    reason,
                    report: SendReport::empty(SendMode::Multicast),
                });
            }
        }

        info!("Multicast of {} bytes to {} peers", payload.len(), targets.len());
        let pending = Arc::new(PendingSend::new(SendMode::Multicast, payload, &targets));
        self.track(&pending);
        for address in &targets {
            self.registry
                .update(*address, |s| s.last_send_outcome = SendOutcome::None);
        }

        self.pause_scan();
        let fanout = self.config.multicast_fanout.max(1);
        let mut next = 0;
        self.wait_pending(&pending, cancel, |completed| {
            while next < targets.len()
                && next.saturating_sub(completed) < fanout
                && self.interrupted(cancel).is_none()
            {
                let address = targets[next];
                next += 1;
                self.dispatch(&pending, address);
            }
        });
        self.resume_scan();
        self.untrack(&pending);
        Self::conclude(&pending)
    }
}
