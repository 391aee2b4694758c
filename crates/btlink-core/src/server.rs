//! Accepting role: connected clients and outbound notifications.
//!
//! Clients that connect to the local server are tracked in the server
//! connected set. A notification is fragmented like a client write and
//! each fragment goes out after the previous one was confirmed by
//! `on_notify_sent`. Jobs for the same client run one at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use btlink_types::{ConnectionStage, PeerAddress, Role, TransportKind};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::adapter::AdapterContext;
use crate::error::{Error, FailureReason, PlatformResult, Result};
use crate::events::TransportEvent;
use crate::pending::{PendingSend, SendMode, SendReport};
use crate::session::{Job, Step};

#[derive(Debug)]
pub(crate) struct NotifySession {
    current: Option<Job>,
    queue: VecDeque<Job>,
    last_progress: Instant,
}

impl NotifySession {
    fn new() -> Self {
        Self {
            current: None,
            queue: VecDeque::new(),
            last_progress: Instant::now(),
        }
    }

    fn drain_jobs(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.current.take().into_iter().chain(self.queue.drain(..))
    }

    /// Start the next queued job. Returns the first fragment to send.
    fn start_next(&mut self, peer: PeerAddress) -> Option<Bytes> {
        while let Some(job) = self.queue.pop_front() {
            if job.is_abandoned(peer) {
                continue;
            }
            let first = job.fragment();
            self.current = Some(job);
            self.last_progress = Instant::now();
            return first;
        }
        None
    }
}

/// Active notify sessions keyed by client.
pub(crate) type NotifyTable = Mutex<HashMap<PeerAddress, NotifySession>>;

impl AdapterContext {
    fn ensure_server(&self) -> Result<()> {
        self.ensure_started()?;
        if !self.config.server {
            return Err(Error::invalid_parameter("server role is not enabled"));
        }
        Ok(())
    }

    pub(crate) fn notify_one(self: &Arc<Self>, address: PeerAddress, payload: Bytes) -> Result<SendReport> {
        self.ensure_server()?;
        self.check_payload(&payload)?;
        self.notify(payload, vec![address])
    }

    pub(crate) fn notify_all(self: &Arc<Self>, payload: Bytes) -> Result<SendReport> {
        self.ensure_server()?;
        self.check_payload(&payload)?;
        let targets = self.server_peers.snapshot();
        if targets.is_empty() {
            debug!("No clients connected, nothing to notify");
            return Ok(SendReport::empty(SendMode::Notify));
        }
        self.notify(payload, targets)
    }

    fn notify(self: &Arc<Self>, payload: Bytes, targets: Vec<PeerAddress>) -> Result<SendReport> {
        let pending = Arc::new(PendingSend::new(SendMode::Notify, payload, &targets));
        self.track(&pending);

        for address in targets {
            if !self.server_peers.contains(address) {
                self.finish_target(&pending, address, Err(FailureReason::PeerNotConnected));
                continue;
            }
            match Job::new(Arc::clone(&pending), self.config.mtu) {
                Ok(job) => self.submit_notify(address, job),
                Err(e) => self.finish_target(
                    &pending,
                    address,
                    Err(FailureReason::Platform(e.to_string())),
                ),
            }
        }

        let slice = self.config.wait_slice;
        let mut seen = pending.completed_count();
        while !pending.is_complete() {
            if !self.is_started() {
                for address in pending.unresolved() {
                    self.finish_target(&pending, address, Err(FailureReason::AdapterStopped));
                }
                break;
            }
            self.expire_stalled();
            seen = pending.wait_progress(seen, slice);
        }
        self.untrack(&pending);

        let report = pending.report();
        if report.is_success() {
            Ok(report)
        } else {
            let reason = pending
                .first_failure()
                .unwrap_or(FailureReason::Platform("notify left unresolved".into()));
            Err(Error::SendFailed { reason, report })
        }
    }

    fn submit_notify(self: &Arc<Self>, peer: PeerAddress, job: Job) {
        let steps = {
            let mut notifies = self.notifies.lock();
            let session = notifies.entry(peer).or_insert_with(NotifySession::new);
            session.queue.push_back(job);
            if session.current.is_some() {
                Vec::new()
            } else {
                match session.start_next(peer) {
                    Some(data) => vec![Step::Notify(peer, data)],
                    None => {
                        notifies.remove(&peer);
                        Vec::new()
                    }
                }
            }
        };
        self.execute(steps);
    }

    pub(crate) fn on_notify_sent(self: &Arc<Self>, peer: PeerAddress, result: PlatformResult<()>) {
        let steps = {
            let mut notifies = self.notifies.lock();
            let Some(session) = notifies.get_mut(&peer) else {
                debug!("Ignoring notify result for {} without session", peer);
                return;
            };
            let Some(job) = session.current.as_mut() else {
                return;
            };
            let more = result.is_ok() && job.advance();
            let next = if more { job.fragment() } else { None };
            session.last_progress = Instant::now();

            let mut steps = Vec::new();
            if let Some(data) = next {
                steps.push(Step::Notify(peer, data));
            } else if let Some(job) = session.current.take() {
                let outcome = match result {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("Notify to {} failed: {}", peer, e);
                        Err(FailureReason::NotifyFailed(e.to_string()))
                    }
                };
                steps.push(Step::Finish(job.pending, peer, outcome));
            }
            if session.current.is_none() {
                match session.start_next(peer) {
                    Some(data) => steps.push(Step::Notify(peer, data)),
                    None => {
                        notifies.remove(&peer);
                    }
                }
            }
            steps
        };
        self.execute(steps);
    }

    pub(crate) fn on_server_peer_connected(&self, peer: PeerAddress, transport: TransportKind) {
        if !self.server_peers.insert(peer) {
            return;
        }
        self.registry.upsert(peer, |s| {
            s.stage = ConnectionStage::Connected;
            s.transport = transport;
        });
        info!("Client {} connected over {}", peer, transport);
        self.events.send(TransportEvent::PeerConnected {
            address: peer,
            role: Role::Server,
        });
    }

    pub(crate) fn on_server_peer_disconnected(self: &Arc<Self>, peer: PeerAddress) {
        let removed = self.server_peers.remove(peer);
        self.inbound.lock().discard(&(peer, Role::Server));
        let mut steps = Vec::new();
        if let Some(mut session) = self.notifies.lock().remove(&peer) {
            for job in session.drain_jobs() {
                steps.push(Step::Finish(job.pending, peer, Err(FailureReason::Disconnected)));
            }
        }
        if removed {
            if !self.client_peers.contains(peer) {
                self.registry
                    .update(peer, |s| s.stage = ConnectionStage::Disconnected);
            }
            info!("Client {} disconnected", peer);
            self.events.send(TransportEvent::PeerDisconnected {
                address: peer,
                role: Role::Server,
            });
        }
        self.execute(steps);
        if removed {
            self.restart_advertising();
        }
    }

    pub(crate) fn expire_stalled_notifies(&self, now: Instant, timeout: Duration) -> Vec<Step> {
        let mut steps = Vec::new();
        let mut notifies = self.notifies.lock();
        let stalled: Vec<PeerAddress> = notifies
            .iter()
            .filter(|(_, s)| s.current.is_some() && now - s.last_progress > timeout)
            .map(|(a, _)| *a)
            .collect();
        for peer in stalled {
            if let Some(mut session) = notifies.remove(&peer) {
                warn!("Notify to {} stalled for {:?}, expiring", peer, timeout);
                let mut first = true;
                for job in session.drain_jobs() {
                    let reason = if first {
                        FailureReason::Timeout(timeout)
                    } else {
                        FailureReason::Disconnected
                    };
                    first = false;
                    steps.push(Step::Finish(job.pending, peer, Err(reason)));
                }
            }
        }
        steps
    }

    pub(crate) fn abort_notifies(&self, reason: FailureReason) -> Vec<Step> {
        let mut steps = Vec::new();
        for (peer, mut session) in self.notifies.lock().drain() {
            for job in session.drain_jobs() {
                steps.push(Step::Finish(job.pending, peer, Err(reason.clone())));
            }
        }
        steps
    }
}
