use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::operation::{Channel, Completion, FailureReason, OpId, Operation, OperationFailure,
                       OperationKind, OperationStatus, Payload, Priority};
use crate::retry::{DefaultRetryPolicy, GiveUpReason, RetryConfig, RetryKind, RetryPolicy,
                   RetryVerdict};
use crate::scheduler::{Correlation, Retired, Scheduler};
use crate::state::PeerState;
use crate::transport::{BondState, Capability, Transport, TransportEvent, TransportFailure};
use crate::{Event, PeerId, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How often the session's update loop calls [`Manager::tick`]
    pub tick_interval: Duration,
    pub operation_timeout: Duration,
    pub connect_timeout: Duration,
    pub bond_timeout: Duration,
    /// How long a timed-out operation keeps its kind blocked on the channel
    /// in case its answer still turns up; `None` waits as long as the
    /// operation's own timeout
    pub late_callback_grace: Option<Duration>,
    /// Discover capabilities as soon as a connection comes up
    pub auto_discover: bool,
    pub event_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            tick_interval: Duration::from_millis(20),
            operation_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            bond_timeout: Duration::from_secs(30),
            late_callback_grace: None,
            auto_discover: true,
            event_capacity: 64,
            retry: RetryConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn timeout_for(&self, kind: &OperationKind) -> Duration {
        match kind {
            OperationKind::Connect => self.connect_timeout,
            OperationKind::Bond | OperationKind::Unbond => self.bond_timeout,
            _ => self.operation_timeout,
        }
    }
}

/// What the application can see of a peer without going through the
/// update loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub state: PeerState,
    pub capabilities: Vec<Capability>,
}

// Written only by the Manager; read from any thread.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub(crate) peers: DashMap<PeerId, PeerSnapshot>,
    pub(crate) scanning: AtomicBool,
}

// Work that is still pending for a peer; unwound when it's cancelled
const PENDING_WORK: PeerState = PeerState::from_bits_truncate(
    PeerState::CONNECTING.bits() | PeerState::CONNECTING_OVERALL.bits() |
    PeerState::RECONNECTING.bits() | PeerState::DISCOVERING_CAPABILITIES.bits() |
    PeerState::BONDING.bits());

/// The top-level engine
///
/// Owns the [`Scheduler`], the transport and the retry policy, and gives
/// meaning to operations: it drives each peer's state machine from retired
/// operations and unsolicited transport events, queues follow-up work and
/// notifies the application.
///
/// A `Manager` is strictly single threaded and every entry point takes the
/// current time, so it can be driven deterministically. [`Session`] wraps
/// it in an async update loop.
///
/// [`Session`]: crate::Session
pub struct Manager {
    config: ManagerConfig,
    scheduler: Scheduler,
    transport: Box<dyn Transport>,
    policy: Box<dyn RetryPolicy>,
    event_bus: broadcast::Sender<Event>,
    shared: Arc<SharedState>,
}

impl Manager {
    pub fn new(config: ManagerConfig, transport: Box<dyn Transport>) -> Self {
        let (event_bus, _) = broadcast::channel(config.event_capacity.max(1));
        let policy = Box::new(DefaultRetryPolicy::new(config.retry.clone()));
        let mut scheduler = Scheduler::new();
        scheduler.set_late_callback_grace(config.late_callback_grace);
        Manager {
            config,
            scheduler,
            transport,
            policy,
            event_bus,
            shared: Arc::new(SharedState::default()),
        }
    }

    pub fn set_retry_policy(&mut self, policy: Box<dyn RetryPolicy>) -> &mut Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_bus.subscribe()
    }

    pub(crate) fn event_bus(&self) -> broadcast::Sender<Event> {
        self.event_bus.clone()
    }

    pub(crate) fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<PeerState> {
        self.scheduler.peer(peer).map(|record| record.state().state())
    }

    pub fn capabilities(&self, peer: &PeerId) -> Option<&[Capability]> {
        self.scheduler.peer(peer).map(|record| record.capabilities())
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    fn emit(&self, event: Event) {
        // No receivers is fine, nobody is listening yet
        let _ = self.event_bus.send(event);
    }

    fn publish(&self, peer: &PeerId) {
        if let Some(record) = self.scheduler.peer(peer) {
            self.shared.peers.insert(peer.clone(), PeerSnapshot {
                state: record.state().state(),
                capabilities: record.capabilities().to_vec(),
            });
        }
    }

    fn transition(&mut self, peer: &PeerId, enter: PeerState, exit: PeerState, now: Instant) {
        let change = match self.scheduler.peer_mut(peer) {
            Some(record) => record.state.apply(enter, exit, now),
            None => return,
        };
        // A refused transition has already been logged and left the
        // state untouched
        if let Ok(Some(change)) = change {
            self.publish(peer);
            self.emit(Event::PeerStateChanged(change));
        }
    }

    fn state_of(&self, peer: &PeerId) -> PeerState {
        self.peer_state(peer).unwrap_or(PeerState::DISCONNECTED)
    }

    fn reset_retry(&mut self, peer: &PeerId, kinds: &[RetryKind]) {
        if let Some(record) = self.scheduler.peer_mut(peer) {
            for kind in kinds {
                record.retry_context_mut(*kind).reset();
            }
        }
    }

    /// Queues an operation
    ///
    /// `completion` runs exactly once: when the operation succeeds, fails,
    /// times out or is cancelled. Operations that can't be queued at all
    /// (e.g. for a removed peer) return an error and drop `completion`
    /// without running it.
    pub fn enqueue(&mut self, target: Channel, kind: OperationKind, priority: Option<Priority>,
                   completion: Option<Completion>, now: Instant)
                   -> Result<OpId> {
        self.scheduler.check_target(&target, &kind)?;

        if let Channel::Peer(peer) = &target {
            self.scheduler.ensure_peer(peer, now)?;
            self.publish(peer);
            let state = self.state_of(peer);

            if kind.requires_connection() &&
               !state.intersects(PeerState::CONNECTED | PeerState::PENDING_CONNECTION)
            {
                debug!("{}: {:?} needs a connection", peer, kind.request_kind());
                return Ok(self.reject_now(completion, FailureReason::NotConnected));
            }

            match &kind {
                OperationKind::Connect if state.contains(PeerState::CONNECTED) => {
                    debug!("{}: already connected", peer);
                    return Ok(self.reject_now(completion, FailureReason::AlreadyConnected));
                }
                OperationKind::Connect => {
                    if let Some(record) = self.scheduler.peer_mut(peer) {
                        record.explicit_disconnect = false;
                    }
                    self.transition(peer,
                                    PeerState::CONNECTING | PeerState::CONNECTING_OVERALL,
                                    PeerState::DISCONNECTED,
                                    now);
                }
                OperationKind::Disconnect => {
                    let idle = !state.intersects(PeerState::CONNECTED | PeerState::PENDING_CONNECTION);
                    self.abort_connection(peer, now);
                    if idle {
                        debug!("{}: not connected, nothing to disconnect", peer);
                        let id = self.scheduler.allocate_id();
                        if let Some(completion) = completion {
                            completion(Ok(Payload::None));
                        }
                        return Ok(id);
                    }
                    if let Some(record) = self.scheduler.peer_mut(peer) {
                        record.explicit_disconnect = true;
                    }
                }
                OperationKind::DiscoverCapabilities => {
                    self.transition(peer, PeerState::DISCOVERING_CAPABILITIES, PeerState::empty(), now);
                }
                OperationKind::Bond => {
                    self.transition(peer, PeerState::BONDING, PeerState::empty(), now);
                }
                _ => {}
            }
        }

        let id = self.scheduler.allocate_id();
        let timeout = self.config.timeout_for(&kind);
        let mut op = Operation::new(id, target, kind, now, timeout).with_completion(completion);
        if let Some(priority) = priority {
            op = op.with_priority(priority);
        }
        trace!("Queueing {:?}", op);
        self.scheduler.enqueue(op, now)
    }

    // Completes a request that never makes it into a queue
    fn reject_now(&mut self, completion: Option<Completion>, reason: FailureReason) -> OpId {
        let id = self.scheduler.allocate_id();
        if let Some(completion) = completion {
            completion(Err(OperationFailure { reason, attempt: 1, retry_pending: false }));
        }
        id
    }

    // Once a peer is down with no connection on the way, nothing that needs
    // a link can ever run
    fn fail_unreachable(&mut self, peer: &PeerId, now: Instant) {
        if self.state_of(peer).intersects(PeerState::CONNECTED | PeerState::PENDING_CONNECTION) {
            return;
        }
        let failed = self.scheduler.fail_matching(&Channel::Peer(peer.clone()),
                                                  now,
                                                  FailureReason::NotConnected,
                                                  |op| op.kind().requires_connection());
        if !failed.is_empty() {
            debug!("{}: failing {} operation(s) that need a link", peer, failed.len());
        }
        for retired in failed {
            self.retire(retired, now);
        }
    }

    // An explicit disconnect supersedes any connection work still pending
    fn abort_connection(&mut self, peer: &PeerId, now: Instant) {
        let cancelled = self.scheduler.cancel_matching(&Channel::Peer(peer.clone()), now, |op| {
            matches!(op.kind(), OperationKind::Connect | OperationKind::DiscoverCapabilities)
        });
        let enter = if self.state_of(peer).contains(PeerState::CONNECTED) {
            PeerState::empty()
        } else {
            PeerState::DISCONNECTED
        };
        self.transition(peer,
                        enter,
                        PeerState::PENDING_CONNECTION | PeerState::DISCOVERING_CAPABILITIES,
                        now);
        self.reset_retry(peer, &[RetryKind::Connect, RetryKind::DiscoverCapabilities]);
        for retired in cancelled {
            self.retire(retired, now);
        }
        self.fail_unreachable(peer, now);
    }

    fn enqueue_internal(&mut self, peer: &PeerId, kind: OperationKind, priority: Priority,
                        attempt: u32, not_before: Option<Instant>, now: Instant) {
        let id = self.scheduler.allocate_id();
        let timeout = self.config.timeout_for(&kind);
        let op = Operation::new(id, Channel::Peer(peer.clone()), kind, now, timeout)
            .with_priority(priority)
            .internal(attempt, not_before);
        trace!("{}: queueing follow-up {:?}", peer, op);
        if let Err(err) = self.scheduler.enqueue(op, now) {
            warn!("{}: failed to queue follow-up work: {}", peer, err);
        }
    }

    fn auto_discover(&mut self, peer: &PeerId, now: Instant) {
        if !self.config.auto_discover {
            self.transition(peer,
                            PeerState::empty(),
                            PeerState::CONNECTING_OVERALL | PeerState::RECONNECTING,
                            now);
            return;
        }
        if self.state_of(peer).intersects(PeerState::DISCOVERING_CAPABILITIES | PeerState::INITIALIZED) {
            return;
        }
        self.transition(peer, PeerState::DISCOVERING_CAPABILITIES, PeerState::empty(), now);
        self.enqueue_internal(peer, OperationKind::DiscoverCapabilities, Priority::High, 1, None, now);
    }

    /// Expires overdue operations and dispatches whatever can go next
    pub fn tick(&mut self, now: Instant) {
        let retired = self.scheduler.tick(now, self.transport.as_mut());
        for retired in retired {
            self.retire(retired, now);
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Completed { channel, kind, result } => {
                if let Correlation::Retired(retired) =
                    self.scheduler.on_transport_callback(&channel, kind, result)
                {
                    self.retire(retired, now);
                }
            }
            TransportEvent::LinkStateChanged { peer, connected: false, error } => {
                self.on_link_down(&peer, error, now);
            }
            TransportEvent::LinkStateChanged { peer, connected: true, .. } => {
                self.on_link_up(&peer, now);
            }
            TransportEvent::BondStateChanged { peer, state } => {
                let (enter, exit) = match state {
                    BondState::None => (PeerState::empty(), PeerState::BONDING | PeerState::BONDED),
                    BondState::Bonding => (PeerState::BONDING, PeerState::BONDED),
                    BondState::Bonded => (PeerState::BONDED, PeerState::BONDING),
                };
                self.transition(&peer, enter, exit, now);
            }
            TransportEvent::ValueChanged { peer, handle, value } => {
                self.emit(Event::ValueChanged { peer, handle, value });
            }
            TransportEvent::PeerDiscovered { peer } => {
                if self.scheduler.ensure_peer(&peer, now).is_err() {
                    trace!("Ignoring discovery of removed peer {}", peer);
                    return;
                }
                self.publish(&peer);
                self.emit(Event::PeerDiscovered { peer });
            }
        }
    }

    fn on_link_down(&mut self, peer: &PeerId, error: Option<TransportFailure>, now: Instant) {
        let (state, explicit) = match self.scheduler.peer(peer) {
            Some(record) => (record.state().state(), record.is_disconnecting()),
            None => {
                warn!("Spurious disconnect of unknown peer {}", peer);
                return;
            }
        };
        if !state.contains(PeerState::CONNECTED) {
            warn!("Spurious, redundant link loss for {} while {:?}", peer, state);
            return;
        }
        debug!("{}: link lost ({:?})", peer, error);

        self.transition(peer, PeerState::DISCONNECTED, PeerState::empty(), now);
        // Whatever was on the air died with the link; queued traffic waits
        // for the reconnect
        let channel = Channel::Peer(peer.clone());
        let lost = self.scheduler.fail_matching(&channel, now, FailureReason::NotConnected, |op| {
            matches!(op.kind(), OperationKind::DiscoverCapabilities) ||
            (op.status() == &OperationStatus::Dispatched && op.kind().requires_connection())
        });
        for retired in lost {
            self.retire(retired, now);
        }
        if explicit {
            self.fail_unreachable(peer, now);
            return;
        }

        let reason = match error {
            Some(failure) => FailureReason::Reported(failure),
            None => FailureReason::LinkLost,
        };
        let (verdict, failures) = match self.judge(peer, RetryKind::Connect, reason, now) {
            Some(judged) => judged,
            None => return,
        };
        match verdict {
            RetryVerdict::GiveUp(reason) => self.give_up(peer, RetryKind::Connect, reason, failures, now),
            verdict => {
                self.transition(peer,
                                PeerState::RECONNECTING | PeerState::CONNECTING |
                                PeerState::CONNECTING_OVERALL,
                                PeerState::DISCONNECTED,
                                now);
                let not_before = verdict.delay().map(|delay| now + delay);
                self.enqueue_internal(peer, OperationKind::Connect, Priority::High, failures + 1,
                                      not_before, now);
            }
        }
    }

    fn on_link_up(&mut self, peer: &PeerId, now: Instant) {
        let record = match self.scheduler.peer(peer) {
            Some(record) => record,
            None => {
                warn!("Spurious connection of unknown peer {}", peer);
                return;
            }
        };
        if record.state().is(PeerState::CONNECTED) {
            trace!("{}: redundant link-up", peer);
            return;
        }
        if record.is_disconnecting() {
            warn!("{}: ignoring link-up while disconnecting", peer);
            return;
        }
        if let Some(op) = record.queue().in_flight() {
            if matches!(op.kind(), OperationKind::Connect) {
                trace!("{}: link-up ahead of the connect callback", peer);
                return;
            }
        }

        // The link came up without us asking (or ahead of a delayed retry)
        debug!("{}: implicitly connected", peer);
        let satisfied = self.scheduler.cancel_matching(&Channel::Peer(peer.clone()), now, |op| {
            matches!(op.kind(), OperationKind::Connect)
        });
        self.transition(peer,
                        PeerState::CONNECTED,
                        PeerState::CONNECTING | PeerState::RECONNECTING,
                        now);
        self.reset_retry(peer, &[RetryKind::Connect]);
        for Retired { mut op, .. } in satisfied {
            op.complete(Ok(Payload::None));
        }
        self.auto_discover(peer, now);
    }

    // Records a failure against a retry context and asks the policy what
    // to do about it
    fn judge(&mut self, peer: &PeerId, kind: RetryKind, reason: FailureReason, now: Instant)
             -> Option<(RetryVerdict, u32)> {
        let record = self.scheduler.peer_mut(peer)?;
        let ctx = record.retry_context_mut(kind);
        ctx.record_failure(reason, now);
        let verdict = self.policy.decide(ctx);
        ctx.record_verdict(verdict.clone());
        debug!("{}: {:?} failure {} -> {:?}", peer, kind, ctx.failures(), verdict);
        Some((verdict, ctx.failures()))
    }

    fn give_up(&mut self, peer: &PeerId, kind: RetryKind, reason: GiveUpReason,
               attempts: u32, now: Instant) {
        warn!("{}: giving up on {:?} after {} attempt(s): {:?}", peer, kind, attempts, reason);
        match kind {
            RetryKind::Connect => {
                self.transition(peer,
                                PeerState::DISCONNECTED,
                                PeerState::PENDING_CONNECTION,
                                now);
            }
            RetryKind::DiscoverCapabilities => {
                self.transition(peer,
                                PeerState::empty(),
                                PeerState::DISCOVERING_CAPABILITIES | PeerState::PENDING_CONNECTION,
                                now);
                // A link without capabilities is useless
                if let Some(record) = self.scheduler.peer_mut(peer) {
                    record.explicit_disconnect = true;
                }
                self.enqueue_internal(peer, OperationKind::Disconnect, Priority::Critical, 1, None, now);
            }
            RetryKind::Bond => {
                self.transition(peer, PeerState::empty(), PeerState::BONDING, now);
            }
        }
        self.reset_retry(peer, &[kind]);
        self.emit(Event::PeerGaveUp { peer: peer.clone(), kind, reason, attempts, at: now });
        if kind == RetryKind::Connect {
            self.fail_unreachable(peer, now);
        }
    }

    fn retire(&mut self, retired: Retired, now: Instant) {
        let Retired { mut op, result } = retired;
        match result {
            Ok(payload) => {
                trace!("{} succeeded", op.id());
                self.on_success(&op, &payload, now);
                op.complete(Ok(payload));
            }
            Err(reason) => {
                trace!("{} failed: {}", op.id(), reason);
                let retry_pending = self.on_failure(&op, &reason, now);
                let attempt = op.attempt();
                op.complete(Err(OperationFailure { reason, attempt, retry_pending }));
            }
        }
    }

    fn on_success(&mut self, op: &Operation, payload: &Payload, now: Instant) {
        let peer = match op.target() {
            Channel::Manager => {
                let scanning = match op.kind() {
                    OperationKind::StartScan => true,
                    OperationKind::StopScan => false,
                    _ => return,
                };
                if self.shared.scanning.swap(scanning, Ordering::SeqCst) != scanning {
                    self.emit(Event::ScanningChanged { scanning });
                }
                return;
            }
            Channel::Peer(peer) => peer.clone(),
        };

        match op.kind() {
            OperationKind::Connect => {
                self.transition(&peer,
                                PeerState::CONNECTED,
                                PeerState::CONNECTING | PeerState::DISCONNECTED,
                                now);
                self.reset_retry(&peer, &[RetryKind::Connect]);
                self.auto_discover(&peer, now);
            }
            OperationKind::DiscoverCapabilities => {
                if let (Some(record), Payload::Capabilities(capabilities)) =
                    (self.scheduler.peer_mut(&peer), payload)
                {
                    record.capabilities = capabilities.clone();
                }
                self.reset_retry(&peer, &[RetryKind::DiscoverCapabilities]);
                if self.state_of(&peer).contains(PeerState::CONNECTED) {
                    self.transition(&peer,
                                    PeerState::INITIALIZED,
                                    PeerState::DISCOVERING_CAPABILITIES |
                                    PeerState::CONNECTING_OVERALL |
                                    PeerState::RECONNECTING,
                                    now);
                } else {
                    warn!("{}: capabilities arrived after the link went down", peer);
                    self.transition(&peer, PeerState::empty(), PeerState::DISCOVERING_CAPABILITIES, now);
                }
                self.publish(&peer);
            }
            OperationKind::Disconnect => {
                if let Some(record) = self.scheduler.peer_mut(&peer) {
                    record.explicit_disconnect = false;
                }
                self.transition(&peer, PeerState::DISCONNECTED, PeerState::PENDING_CONNECTION, now);
                self.fail_unreachable(&peer, now);
            }
            OperationKind::Bond => {
                self.reset_retry(&peer, &[RetryKind::Bond]);
                self.transition(&peer, PeerState::BONDED, PeerState::BONDING, now);
            }
            OperationKind::Unbond => {
                self.transition(&peer, PeerState::empty(), PeerState::BONDED | PeerState::BONDING, now);
            }
            _ => {}
        }
    }

    // Returns whether another attempt has been queued
    fn on_failure(&mut self, op: &Operation, reason: &FailureReason, now: Instant) -> bool {
        let peer = match op.target() {
            Channel::Peer(peer) => peer.clone(),
            Channel::Manager => return false,
        };
        if *reason == FailureReason::Cancelled {
            return false;
        }
        let kind = match op.kind() {
            OperationKind::Connect => RetryKind::Connect,
            OperationKind::DiscoverCapabilities => RetryKind::DiscoverCapabilities,
            OperationKind::Bond => RetryKind::Bond,
            _ => return false,
        };

        if kind == RetryKind::DiscoverCapabilities &&
           !self.state_of(&peer).contains(PeerState::CONNECTED)
        {
            debug!("{}: discovery failed without a link, leaving it to reconnection", peer);
            self.transition(&peer, PeerState::empty(), PeerState::DISCOVERING_CAPABILITIES, now);
            return false;
        }
        if kind == RetryKind::Connect && self.state_of(&peer).contains(PeerState::CONNECTED) {
            trace!("{}: connect failure after the link came up anyway", peer);
            return false;
        }

        let (verdict, failures) = match self.judge(&peer, kind, reason.clone(), now) {
            Some(judged) => judged,
            None => return false,
        };
        match verdict {
            RetryVerdict::GiveUp(why) => {
                self.give_up(&peer, kind, why, failures, now);
                false
            }
            verdict => {
                let not_before = verdict.delay().map(|delay| now + delay);
                self.enqueue_internal(&peer, op.kind().clone(), Priority::High, op.attempt() + 1,
                                      not_before, now);
                true
            }
        }
    }

    /// Cancels everything queued or in flight on `target`
    ///
    /// Completions see `FailureReason::Cancelled`, the transport is never
    /// involved and any connection work still pending for the peer is
    /// unwound.
    pub fn cancel_all(&mut self, target: &Channel, now: Instant) -> usize {
        let cancelled = self.scheduler.cancel_all(target, now);
        let count = cancelled.len();
        for retired in cancelled {
            self.retire(retired, now);
        }
        if let Channel::Peer(peer) = target {
            let state = self.state_of(peer);
            let enter = if state.contains(PeerState::CONNECTED) {
                PeerState::empty()
            } else {
                PeerState::DISCONNECTED
            };
            self.transition(peer, enter, PENDING_WORK, now);
            self.reset_retry(peer, &[RetryKind::Connect, RetryKind::DiscoverCapabilities, RetryKind::Bond]);
            if let Some(record) = self.scheduler.peer_mut(peer) {
                record.explicit_disconnect = false;
            }
        }
        debug!("{}: cancelled {} operation(s)", target, count);
        count
    }

    /// Cancels everything for `peer` and forgets about it; any later
    /// request for this peer fails with `InvalidState`
    pub fn remove_peer(&mut self, peer: &PeerId, now: Instant) {
        for retired in self.scheduler.remove_peer(peer, now) {
            self.retire(retired, now);
        }
        self.shared.peers.remove(peer);
        debug!("{}: removed", peer);
    }
}
