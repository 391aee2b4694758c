//! Per-peer session state machine for the client role.
//!
//! Each peer with outstanding work has a [`Session`] holding the job in
//! progress and a FIFO of queued jobs. Platform callbacks advance the
//! session under the session lock and produce a list of [`Step`]s, which
//! are executed after the lock is released. A synchronous platform error
//! from a step is fed back exactly like the matching failure callback.
//!
//! ```text
//! Discovered --connect--> Connecting --connected--> Connected
//!     Connected --(cached armed)--> NotificationArmed --write--> ...
//!     Connected --discover--> CapabilitiesReady --arm--> NotificationArmed
//!     CapabilitiesReady (no notify characteristic) --> Connected --write--> ...
//! any failure --> Disconnected
//! ```

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use btlink_types::fragment;
use btlink_types::{Capabilities, ConnectionStage, PeerAddress, Role, TransportKind};
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::AdapterContext;
use crate::error::{Error, FailureReason, PlatformResult, Result};
use crate::events::TransportEvent;
use crate::pending::PendingSend;
use crate::traits::LinkEvent;

/// Nested step execution deeper than this continues on the task pool.
const MAX_INLINE_DEPTH: usize = 32;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        DEPTH.with(|d| {
            if d.get() >= MAX_INLINE_DEPTH {
                None
            } else {
                d.set(d.get() + 1);
                Some(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// One datagram on its way to one peer.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) pending: Arc<PendingSend>,
    fragments: Vec<Bytes>,
    next: usize,
}

impl Job {
    pub(crate) fn new(pending: Arc<PendingSend>, mtu: usize) -> Result<Self> {
        let fragments = fragment::fragment(pending.payload(), mtu)
            .map_err(|e| Error::invalid_parameter(e.to_string()))?;
        Ok(Self {
            pending,
            fragments,
            next: 0,
        })
    }

    pub(crate) fn fragment(&self) -> Option<Bytes> {
        self.fragments.get(self.next).cloned()
    }

    /// Move to the next fragment. Returns `false` when none is left.
    pub(crate) fn advance(&mut self) -> bool {
        self.next += 1;
        self.next < self.fragments.len()
    }

    /// The target was already resolved elsewhere (cancelled or stopped).
    pub(crate) fn is_abandoned(&self, peer: PeerAddress) -> bool {
        !self.pending.unresolved().contains(&peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Discovering,
    Arming,
    Writing,
}

#[derive(Debug)]
pub(crate) struct Session {
    phase: Phase,
    transport: TransportKind,
    characteristic: Uuid,
    current: Option<Job>,
    queue: VecDeque<Job>,
    last_progress: Instant,
}

impl Session {
    fn new(transport: TransportKind) -> Self {
        Self {
            phase: Phase::Idle,
            transport,
            characteristic: btlink_types::uuids::REQUEST_CHARACTERISTIC,
            current: None,
            queue: VecDeque::new(),
            last_progress: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    fn drain_jobs(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.current.take().into_iter().chain(self.queue.drain(..))
    }
}

/// Active client sessions keyed by peer.
pub(crate) type SessionTable = Mutex<HashMap<PeerAddress, Session>>;

/// Work to do once the session lock is released.
pub(crate) enum Step {
    PauseScan,
    ResumeScan,
    Connect(PeerAddress, TransportKind),
    Discover(PeerAddress),
    Arm(PeerAddress, Uuid),
    Write(PeerAddress, Uuid, Bytes),
    Notify(PeerAddress, Bytes),
    Disconnect(PeerAddress),
    Close(PeerAddress),
    Finish(Arc<PendingSend>, PeerAddress, std::result::Result<(), FailureReason>),
}

impl AdapterContext {
    /// Run steps on this thread, or on the pool once nesting gets deep.
    pub(crate) fn execute(self: &Arc<Self>, steps: Vec<Step>) {
        if steps.is_empty() {
            return;
        }
        let Some(_guard) = DepthGuard::enter() else {
            self.continue_on_pool(steps);
            return;
        };
        for step in steps {
            self.run_step(step);
        }
    }

    fn continue_on_pool(self: &Arc<Self>, steps: Vec<Step>) {
        let batch = Arc::new(Mutex::new(Some(steps)));
        if let Some(pool) = self.pool() {
            let ctx = Arc::clone(self);
            let queued = Arc::clone(&batch);
            match pool.submit(move || {
                if let Some(steps) = queued.lock().take() {
                    ctx.execute(steps);
                }
            }) {
                Ok(()) => return,
                Err(e) => debug!("Continuing inline: {}", e),
            }
        }
        let leftover = batch.lock().take();
        if let Some(steps) = leftover {
            for step in steps {
                self.run_step(step);
            }
        }
    }

    fn run_step(self: &Arc<Self>, step: Step) {
        match step {
            Step::PauseScan => self.pause_scan(),
            Step::ResumeScan => self.resume_scan(),
            Step::Connect(peer, transport) => {
                debug!("Connecting to {} over {}", peer, transport);
                if let Err(e) = self
                    .platform
                    .connect(peer, transport, self.config.auto_connect)
                {
                    self.on_link_event(peer, LinkEvent::ConnectFailed(e));
                }
            }
            Step::Discover(peer) => {
                if let Err(e) = self.platform.discover_capabilities(peer) {
                    self.on_capabilities(peer, Err(e));
                }
            }
            Step::Arm(peer, characteristic) => {
                if let Err(e) = self.platform.arm_notification(peer, characteristic) {
                    self.on_armed(peer, Err(e));
                }
            }
            Step::Write(peer, characteristic, data) => {
                if let Err(e) = self.platform.write(peer, characteristic, data) {
                    self.on_write_result(peer, Err(e));
                }
            }
            Step::Notify(peer, data) => {
                if let Err(e) = self.platform.notify(peer, data) {
                    self.on_notify_sent(peer, Err(e));
                }
            }
            Step::Disconnect(peer) => {
                if let Err(e) = self.platform.disconnect(peer) {
                    debug!("Disconnect of {} refused: {}", peer, e);
                }
            }
            Step::Close(peer) => {
                if let Err(e) = self.platform.close(peer) {
                    debug!("Close of {} refused: {}", peer, e);
                }
            }
            Step::Finish(pending, peer, result) => self.finish_target(&pending, peer, result),
        }
    }

    /// Queue a job for `peer` and start it if the session is idle.
    pub(crate) fn submit_job(self: &Arc<Self>, peer: PeerAddress, transport: TransportKind, job: Job) {
        let steps = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(peer)
                .or_insert_with(|| Session::new(transport));
            session.queue.push_back(job);
            if session.phase == Phase::Idle {
                let steps = self.start_next(peer, session);
                if session.phase == Phase::Idle {
                    sessions.remove(&peer);
                }
                steps
            } else {
                debug!("Queued job for {} behind active session", peer);
                Vec::new()
            }
        };
        self.execute(steps);
    }

    /// Pick the next live job and decide the first step for it.
    fn start_next(&self, peer: PeerAddress, session: &mut Session) -> Vec<Step> {
        loop {
            let Some(job) = session.queue.pop_front() else {
                session.phase = Phase::Idle;
                session.current = None;
                return Vec::new();
            };
            if job.is_abandoned(peer) {
                continue;
            }
            session.current = Some(job);
            session.touch();
            break;
        }

        if self.client_peers.contains(peer) {
            let state = self.registry.get(peer);
            match state.and_then(|s| s.capabilities) {
                Some(caps) => self.begin_write(session, peer, caps.write_characteristic),
                None => {
                    session.phase = Phase::Discovering;
                    vec![Step::Discover(peer)]
                }
            }
        } else {
            session.phase = Phase::Connecting;
            let transport = session.transport;
            self.registry.upsert(peer, |s| {
                s.stage = ConnectionStage::Connecting;
                s.transport = transport;
            });
            self.discovery.remove(peer);
            vec![Step::PauseScan, Step::Connect(peer, transport)]
        }
    }

    fn begin_write(&self, session: &mut Session, peer: PeerAddress, characteristic: Uuid) -> Vec<Step> {
        session.phase = Phase::Writing;
        session.characteristic = characteristic;
        match session.current.as_ref().and_then(Job::fragment) {
            Some(data) => vec![Step::Write(peer, characteristic, data)],
            None => Vec::new(),
        }
    }

    /// Fresh link: reuse the armed capability cache or discover.
    fn after_connected(&self, peer: PeerAddress, session: &mut Session) -> Vec<Step> {
        let cached = self.registry.update(peer, |s| {
            if s.notification_armed
                && let Some(caps) = s.capabilities.clone()
            {
                s.stage = ConnectionStage::NotificationArmed;
                Some(caps)
            } else {
                None
            }
        });
        match cached.flatten() {
            Some(caps) => {
                debug!("Reusing armed capabilities for {}", peer);
                self.begin_write(session, peer, caps.write_characteristic)
            }
            None => {
                session.phase = Phase::Discovering;
                vec![Step::Discover(peer)]
            }
        }
    }

    /// Remove the session, mark the link down and fail every job.
    fn teardown(
        &self,
        peer: PeerAddress,
        mut session: Session,
        reason: FailureReason,
        disconnect: bool,
    ) -> Vec<Step> {
        if self.client_peers.remove(peer) {
            self.events.send(TransportEvent::PeerDisconnected {
                address: peer,
                role: Role::Client,
            });
        }
        self.registry.update(peer, |s| s.stage = ConnectionStage::Disconnected);

        let mut steps = Vec::new();
        if disconnect {
            steps.push(Step::Disconnect(peer));
        } else {
            steps.push(Step::Close(peer));
        }
        let mut first = true;
        for job in session.drain_jobs() {
            let r = if first {
                reason.clone()
            } else {
                FailureReason::Disconnected
            };
            first = false;
            steps.push(Step::Finish(job.pending, peer, Err(r)));
        }
        steps.push(Step::ResumeScan);
        steps
    }

    pub(crate) fn on_link_event(self: &Arc<Self>, peer: PeerAddress, event: LinkEvent) {
        let steps = {
            let mut sessions = self.sessions.lock();
            match event {
                LinkEvent::Connected => {
                    self.client_peers.insert(peer);
                    self.registry
                        .upsert(peer, |s| s.stage = ConnectionStage::Connected);
                    self.discovery.remove(peer);
                    info!("Connected to {}", peer);
                    self.events.send(TransportEvent::PeerConnected {
                        address: peer,
                        role: Role::Client,
                    });
                    match sessions.get_mut(&peer) {
                        Some(session) if session.phase == Phase::Connecting => {
                            session.touch();
                            self.after_connected(peer, session)
                        }
                        _ => Vec::new(),
                    }
                }
                LinkEvent::ConnectFailed(e) => {
                    warn!("Connection to {} failed: {}", peer, e);
                    self.discovery.remove(peer);
                    match sessions.remove(&peer) {
                        Some(session) if session.phase == Phase::Connecting => self.teardown(
                            peer,
                            session,
                            FailureReason::ConnectFailed(e.to_string()),
                            false,
                        ),
                        Some(session) => {
                            sessions.insert(peer, session);
                            Vec::new()
                        }
                        None => {
                            self.client_peers.remove(peer);
                            self.registry
                                .update(peer, |s| s.stage = ConnectionStage::Disconnected);
                            vec![Step::Close(peer), Step::ResumeScan]
                        }
                    }
                }
                LinkEvent::Disconnected => {
                    let was_connected = self.client_peers.remove(peer);
                    self.inbound.lock().discard(&(peer, Role::Client));
                    if was_connected {
                        info!("Disconnected from {}", peer);
                        self.events.send(TransportEvent::PeerDisconnected {
                            address: peer,
                            role: Role::Client,
                        });
                    }
                    match sessions.remove(&peer) {
                        // a late event for a previous link, the new attempt carries on
                        Some(session) if session.phase == Phase::Connecting => {
                            sessions.insert(peer, session);
                            Vec::new()
                        }
                        Some(session) => {
                            self.teardown(peer, session, FailureReason::Disconnected, false)
                        }
                        None => {
                            self.registry.update(peer, |s| {
                                if s.stage.is_linked() || s.stage == ConnectionStage::Connecting
                                {
                                    s.stage = ConnectionStage::Disconnected;
                                }
                            });
                            vec![Step::Close(peer), Step::ResumeScan]
                        }
                    }
                }
            }
        };
        self.execute(steps);
    }

    pub(crate) fn on_capabilities(
        self: &Arc<Self>,
        peer: PeerAddress,
        result: PlatformResult<Capabilities>,
    ) {
        let steps = {
            let mut sessions = self.sessions.lock();
            if sessions.get(&peer).map(|s| s.phase) != Some(Phase::Discovering) {
                debug!("Ignoring capability result for {} outside discovery", peer);
                return;
            }
            match result {
                Ok(caps) => {
                    debug!("Capabilities of {}: {:?}", peer, caps);
                    let notify = caps.notify_characteristic;
                    let write = caps.write_characteristic;
                    self.registry.update(peer, |s| {
                        s.capabilities = Some(caps);
                        s.stage = ConnectionStage::CapabilitiesReady;
                    });
                    match sessions.get_mut(&peer) {
                        Some(session) => {
                            session.touch();
                            match notify {
                                Some(ch) => {
                                    session.phase = Phase::Arming;
                                    session.characteristic = write;
                                    vec![Step::Arm(peer, ch)]
                                }
                                None => {
                                    self.registry
                                        .update(peer, |s| s.stage = ConnectionStage::Connected);
                                    self.begin_write(session, peer, write)
                                }
                            }
                        }
                        None => Vec::new(),
                    }
                }
                Err(e) => {
                    warn!("Capability discovery on {} failed: {}", peer, e);
                    match sessions.remove(&peer) {
                        Some(session) => self.teardown(
                            peer,
                            session,
                            FailureReason::CapabilityDiscoveryFailed(e.to_string()),
                            true,
                        ),
                        None => Vec::new(),
                    }
                }
            }
        };
        self.execute(steps);
    }

    pub(crate) fn on_armed(self: &Arc<Self>, peer: PeerAddress, result: PlatformResult<()>) {
        let steps = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&peer) {
                Some(session) if session.phase == Phase::Arming => {
                    session.touch();
                    match result {
                        Ok(()) => {
                            self.registry.update(peer, |s| {
                                s.stage = ConnectionStage::NotificationArmed;
                                s.notification_armed = true;
                            });
                        }
                        Err(e) => {
                            warn!(
                                "Arming notifications on {} failed, writing without: {}",
                                peer, e
                            );
                            self.registry.update(peer, |s| {
                                s.stage = ConnectionStage::Connected;
                                s.notification_armed = false;
                            });
                        }
                    }
                    let write = session.characteristic;
                    self.begin_write(session, peer, write)
                }
                _ => Vec::new(),
            }
        };
        self.execute(steps);
    }

    pub(crate) fn on_write_result(self: &Arc<Self>, peer: PeerAddress, result: PlatformResult<()>) {
        let steps = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(&peer) else {
                debug!("Ignoring write result for {} without session", peer);
                return;
            };
            if session.phase != Phase::Writing {
                return;
            }
            session.touch();
            match result {
                Ok(()) => {
                    let more = session.current.as_mut().is_some_and(Job::advance);
                    if more {
                        let ch = session.characteristic;
                        self.begin_write(session, peer, ch)
                    } else {
                        let mut steps = Vec::new();
                        if let Some(job) = session.current.take() {
                            debug!("Send to {} acknowledged", peer);
                            steps.push(Step::Finish(job.pending, peer, Ok(())));
                            steps.push(Step::ResumeScan);
                        }
                        steps.extend(self.start_next(peer, session));
                        if session.phase == Phase::Idle {
                            sessions.remove(&peer);
                        }
                        steps
                    }
                }
                Err(e) => {
                    warn!("Write to {} failed: {}", peer, e);
                    match sessions.remove(&peer) {
                        Some(session) => self.teardown(
                            peer,
                            session,
                            FailureReason::WriteFailed(e.to_string()),
                            true,
                        ),
                        None => Vec::new(),
                    }
                }
            }
        };
        self.execute(steps);
    }

    /// Expire client and server sessions that made no progress in time.
    pub(crate) fn expire_stalled(self: &Arc<Self>) {
        let Some(timeout) = self.config.operation_timeout else {
            return;
        };
        let now = Instant::now();
        let mut steps = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            let stalled: Vec<PeerAddress> = sessions
                .iter()
                .filter(|(_, s)| s.current.is_some() && now - s.last_progress > timeout)
                .map(|(a, _)| *a)
                .collect();
            for peer in stalled {
                if let Some(session) = sessions.remove(&peer) {
                    warn!("Session with {} stalled for {:?}, expiring", peer, timeout);
                    steps.extend(self.teardown(
                        peer,
                        session,
                        FailureReason::Timeout(timeout),
                        true,
                    ));
                }
            }
        }
        steps.extend(self.expire_stalled_notifies(now, timeout));
        self.execute(steps);
    }

    /// Fail every session with `reason` and forget them.
    pub(crate) fn abort_sessions(self: &Arc<Self>, reason: FailureReason) {
        let mut steps = Vec::new();
        {
            let mut sessions = self.sessions.lock();
            for (peer, mut session) in sessions.drain() {
                for job in session.drain_jobs() {
                    steps.push(Step::Finish(job.pending, peer, Err(reason.clone())));
                }
            }
        }
        steps.extend(self.abort_notifies(reason));
        self.execute(steps);
    }

    /// Number of peers with an active session.
    pub(crate) fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn has_session(&self, peer: PeerAddress) -> bool {
        self.sessions.lock().contains_key(&peer)
    }

    /// Disconnect the client link to `peer`, failing its jobs with `reason`.
    pub(crate) fn drop_client_link(self: &Arc<Self>, peer: PeerAddress, reason: FailureReason) {
        let steps = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(&peer) {
                Some(session) => self.teardown(peer, session, reason, true),
                None if self.client_peers.remove(peer) => {
                    self.events.send(TransportEvent::PeerDisconnected {
                        address: peer,
                        role: Role::Client,
                    });
                    vec![Step::Disconnect(peer), Step::ResumeScan]
                }
                None => Vec::new(),
            }
        };
        self.execute(steps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::SendMode;

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]).unwrap()
    }

    fn job(payload: &'static [u8], mtu: usize) -> Job {
        let pending = PendingSend::new(SendMode::Unicast, Bytes::from_static(payload), &[addr(1)]);
        Job::new(Arc::new(pending), mtu).unwrap()
    }

    #[test]
    fn test_job_walks_fragments_in_order() {
        let mut job = job(b"0123456789", 6);
        let expected = fragment::fragment(b"0123456789", 6).unwrap();
        assert!(expected.len() > 1);

        let mut seen = vec![job.fragment().unwrap()];
        while job.advance() {
            seen.push(job.fragment().unwrap());
        }
        assert_eq!(seen, expected);
        assert!(job.fragment().is_none());
    }

    #[test]
    fn test_job_rejects_mtu_below_header() {
        let pending = PendingSend::new(SendMode::Unicast, Bytes::from_static(b"x"), &[addr(1)]);
        assert!(Job::new(Arc::new(pending), 1).is_err());
    }

    #[test]
    fn test_job_is_abandoned_once_resolved() {
        let job = job(b"data", 20);
        assert!(!job.is_abandoned(addr(1)));
        assert!(job.pending.claim(addr(1), Err(FailureReason::Cancelled)));
        job.pending.complete(addr(1));
        assert!(job.is_abandoned(addr(1)));
    }

    #[test]
    fn test_depth_guard_limits_nesting() {
        let mut guards = Vec::new();
        for _ in 0..MAX_INLINE_DEPTH {
            guards.push(DepthGuard::enter().unwrap());
        }
        assert!(DepthGuard::enter().is_none());
        guards.pop();
        assert!(DepthGuard::enter().is_some());
    }
}
