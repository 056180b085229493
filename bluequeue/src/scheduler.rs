use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::operation::{Channel, FailureReason, OpId, Operation, OperationKind, OperationStatus,
                       Payload, RequestKind};
use crate::queue::ChannelQueue;
use crate::retry::{RetryContext, RetryKind};
use crate::state::{PeerState, PeerStateMachine};
use crate::transport::{Capability, Transport, TransportFailure};
use crate::{Error, PeerId, Result};

/// Everything the engine tracks for one peer
#[derive(Debug)]
pub struct PeerRecord {
    id: PeerId,
    pub(crate) state: PeerStateMachine,
    pub(crate) queue: ChannelQueue,
    connect_retry: RetryContext,
    discover_retry: RetryContext,
    bond_retry: RetryContext,
    pub(crate) explicit_disconnect: bool,
    pub(crate) capabilities: Vec<Capability>,
}

impl PeerRecord {
    fn new(id: PeerId, now: Instant) -> Self {
        PeerRecord {
            state: PeerStateMachine::new(id.clone(), now),
            queue: ChannelQueue::new(Channel::Peer(id.clone())),
            connect_retry: RetryContext::new(RetryKind::Connect),
            discover_retry: RetryContext::new(RetryKind::DiscoverCapabilities),
            bond_retry: RetryContext::new(RetryKind::Bond),
            explicit_disconnect: false,
            capabilities: vec![],
            id,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }
    pub fn state(&self) -> &PeerStateMachine {
        &self.state
    }
    pub fn queue(&self) -> &ChannelQueue {
        &self.queue
    }
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }
    /// Whether the application asked to disconnect and that hasn't
    /// completed yet
    pub fn is_disconnecting(&self) -> bool {
        self.explicit_disconnect
    }

    pub fn retry_context(&self, kind: RetryKind) -> &RetryContext {
        match kind {
            RetryKind::Connect => &self.connect_retry,
            RetryKind::DiscoverCapabilities => &self.discover_retry,
            RetryKind::Bond => &self.bond_retry,
        }
    }

    pub(crate) fn retry_context_mut(&mut self, kind: RetryKind) -> &mut RetryContext {
        match kind {
            RetryKind::Connect => &mut self.connect_retry,
            RetryKind::DiscoverCapabilities => &mut self.discover_retry,
            RetryKind::Bond => &mut self.bond_retry,
        }
    }
}

/// An operation that has reached a terminal status
///
/// The completion hasn't been run yet: whoever retires the operation gets
/// to decide on follow-up work (such as a retry) first.
#[derive(Debug)]
pub struct Retired {
    pub(crate) op: Operation,
    pub(crate) result: std::result::Result<Payload, FailureReason>,
}

impl Retired {
    fn new(mut op: Operation, result: std::result::Result<Payload, FailureReason>) -> Self {
        op.status = match &result {
            Ok(_) => OperationStatus::Succeeded,
            Err(FailureReason::TimedOut) => OperationStatus::TimedOut,
            Err(FailureReason::Cancelled) => OperationStatus::Cancelled,
            Err(reason) => OperationStatus::Failed(reason.clone()),
        };
        Retired { op, result }
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }
    pub fn result(&self) -> &std::result::Result<Payload, FailureReason> {
        &self.result
    }
}

/// What became of a transport callback
#[derive(Debug)]
pub enum Correlation {
    /// It answered the operation in flight on its channel
    Retired(Retired),
    /// It was the late answer to a cancelled operation
    Drained(OpId),
    /// It couldn't be attributed to anything and was dropped
    Stale,
}

/// Admits, dispatches, correlates and cancels operations
///
/// The scheduler knows nothing about what an operation *means*; state
/// transitions and retries are the [`Manager`](crate::Manager)'s business.
#[derive(Debug)]
pub struct Scheduler {
    next_id: u64,
    global: ChannelQueue,
    // Ordered so dispatch order across peers is deterministic
    peers: BTreeMap<PeerId, PeerRecord>,
    removed: HashSet<PeerId>,
    // None waits as long as the timed-out operation's own timeout
    late_callback_grace: Option<Duration>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            next_id: 1,
            global: ChannelQueue::new(Channel::Manager),
            peers: BTreeMap::new(),
            removed: HashSet::new(),
            late_callback_grace: None,
        }
    }

    /// How long a timed-out operation's kind stays blocked on its channel
    /// waiting for the late callback
    pub(crate) fn set_late_callback_grace(&mut self, grace: Option<Duration>) {
        self.late_callback_grace = grace;
    }

    pub(crate) fn allocate_id(&mut self) -> OpId {
        let id = OpId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Checks that `kind` may be queued on `target`
    pub fn check_target(&self, target: &Channel, kind: &OperationKind) -> Result<()> {
        match target {
            Channel::Manager if !kind.is_global() => {
                Err(Error::InvalidState(format!("{:?} needs a peer", kind.request_kind())))
            }
            Channel::Peer(peer) if kind.is_global() => {
                Err(Error::InvalidState(format!("{:?} can't target peer {}", kind.request_kind(), peer)))
            }
            Channel::Peer(peer) if self.removed.contains(peer) => {
                Err(Error::InvalidState(format!("peer {} has been removed", peer)))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_peer(&mut self, peer: &PeerId, now: Instant) -> Result<&mut PeerRecord> {
        if self.removed.contains(peer) {
            return Err(Error::InvalidState(format!("peer {} has been removed", peer)));
        }
        Ok(self.peers.entry(peer.clone()).or_insert_with(|| {
            trace!("Creating state for peer {}", peer);
            PeerRecord::new(peer.clone(), now)
        }))
    }

    pub(crate) fn enqueue(&mut self, op: Operation, now: Instant) -> Result<OpId> {
        self.check_target(&op.target, &op.kind)?;
        let id = op.id;
        match op.target.clone() {
            Channel::Manager => self.global.push(op),
            Channel::Peer(peer) => self.ensure_peer(&peer, now)?.queue.push(op),
        }
        Ok(id)
    }

    fn queue_mut(&mut self, channel: &Channel) -> Option<&mut ChannelQueue> {
        match channel {
            Channel::Manager => Some(&mut self.global),
            Channel::Peer(peer) => self.peers.get_mut(peer).map(|record| &mut record.queue),
        }
    }

    pub fn queue(&self, channel: &Channel) -> Option<&ChannelQueue> {
        match channel {
            Channel::Manager => Some(&self.global),
            Channel::Peer(peer) => self.peers.get(peer).map(|record| &record.queue),
        }
    }

    pub fn in_flight(&self, channel: &Channel) -> Option<&Operation> {
        self.queue(channel).and_then(|queue| queue.in_flight())
    }

    pub fn queued(&self, channel: &Channel) -> Vec<&Operation> {
        match self.queue(channel) {
            Some(queue) => queue.queued().collect(),
            None => vec![],
        }
    }

    pub fn peer(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub(crate) fn peer_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn is_removed(&self, peer: &PeerId) -> bool {
        self.removed.contains(peer)
    }

    /// Expires overdue operations then fills every idle channel
    ///
    /// Returns everything that was retired along the way: timeouts, plus
    /// operations the transport refused to start. Operations that need a
    /// link stay queued while their peer isn't connected.
    pub(crate) fn tick(&mut self, now: Instant, transport: &mut dyn Transport) -> Vec<Retired> {
        let mut retired = vec![];
        let grace = self.late_callback_grace;
        let peers = self.peers.values_mut().map(|record| {
                                              let connected = record.state.is(PeerState::CONNECTED);
                                              (&mut record.queue, connected)
                                          });
        let queues = std::iter::once((&mut self.global, true)).chain(peers);
        for (queue, connected) in queues {
            queue.expire_draining(now);

            if let Some(op) = queue.take_expired(now, grace) {
                warn!("{}: {} ({:?}) timed out", queue.channel(), op.id, op.kind.request_kind());
                retired.push(Retired::new(op, Err(FailureReason::TimedOut)));
            }

            while queue.is_idle() {
                let op = match queue.pop_eligible(now, connected) {
                    Some(op) => op,
                    None => break,
                };
                if queue.begin(op, now).is_err() {
                    break;
                }
                let dispatched = match queue.in_flight() {
                    Some(op) => {
                        trace!("{}: dispatching {} ({:?}, attempt {})",
                               queue.channel(), op.id, op.kind.request_kind(), op.attempt);
                        dispatch(transport, op)
                    }
                    None => break,
                };
                if let Err(err) = dispatched {
                    if let Some(op) = queue.take_in_flight() {
                        warn!("{}: transport refused {}: {}", queue.channel(), op.id, err);
                        retired.push(Retired::new(op, Err(FailureReason::Rejected(err.to_string()))));
                    }
                }
            }
        }
        retired
    }

    /// Attributes a transport callback to the operation it answers
    pub(crate) fn on_transport_callback(&mut self, channel: &Channel, kind: RequestKind,
                                        result: std::result::Result<Payload, TransportFailure>)
                                        -> Correlation {
        let queue = match self.queue_mut(channel) {
            Some(queue) => queue,
            None => {
                warn!("Spurious {:?} callback for unknown channel {}", kind, channel);
                return Correlation::Stale;
            }
        };

        if let Some(op) = queue.take_matching(kind) {
            trace!("{}: {} answered by {:?} callback", channel, op.id, kind);
            return Correlation::Retired(Retired::new(op, result.map_err(FailureReason::Reported)));
        }
        if let Some(cancelled) = queue.absorb_stale(kind) {
            trace!("{}: dropping late {:?} callback of retired {}", channel, kind, cancelled);
            return Correlation::Drained(cancelled);
        }

        match queue.in_flight() {
            Some(op) => warn!("Spurious {:?} callback on {} while {} ({:?}) is in flight",
                              kind, channel, op.id, op.kind.request_kind()),
            None => warn!("Spurious, unbalanced {:?} callback on idle {}", kind, channel),
        }
        Correlation::Stale
    }

    /// Cancels every queued and in-flight operation on `target` that
    /// matches `predicate`, without involving the transport
    pub(crate) fn cancel_matching<F>(&mut self, target: &Channel, now: Instant, predicate: F)
                                     -> Vec<Retired>
        where F: FnMut(&Operation) -> bool
    {
        self.fail_matching(target, now, FailureReason::Cancelled, predicate)
    }

    /// Like `cancel_matching` but retires the operations with `reason`
    pub(crate) fn fail_matching<F>(&mut self, target: &Channel, now: Instant, reason: FailureReason,
                                   predicate: F)
                                   -> Vec<Retired>
        where F: FnMut(&Operation) -> bool
    {
        let queue = match self.queue_mut(target) {
            Some(queue) => queue,
            None => return vec![],
        };
        queue.drain_matching(now, predicate)
             .into_iter()
             .map(|op| {
                 trace!("{}: {} ({:?}) {}", target, op.id, op.kind.request_kind(), reason);
                 Retired::new(op, Err(reason.clone()))
             })
             .collect()
    }

    pub(crate) fn cancel_all(&mut self, target: &Channel, now: Instant) -> Vec<Retired> {
        self.cancel_matching(target, now, |_| true)
    }

    /// Cancels everything for `peer`, forgets it and refuses any further
    /// operations for it
    pub(crate) fn remove_peer(&mut self, peer: &PeerId, now: Instant) -> Vec<Retired> {
        let retired = self.cancel_all(&Channel::Peer(peer.clone()), now);
        self.peers.remove(peer);
        self.removed.insert(peer.clone());
        retired
    }
}

fn dispatch(transport: &mut dyn Transport, op: &Operation) -> Result<()> {
    match (&op.kind, op.target.peer()) {
        (OperationKind::StartScan, _) => transport.start_scanning(),
        (OperationKind::StopScan, _) => transport.stop_scanning(),
        (_, None) => Err(Error::InvalidState(format!("{} has no peer to target", op.id))),
        (OperationKind::Connect, Some(peer)) => transport.connect(peer),
        (OperationKind::Disconnect, Some(peer)) => transport.disconnect(peer),
        (OperationKind::DiscoverCapabilities, Some(peer)) => transport.discover_capabilities(peer),
        (OperationKind::ReadValue { handle }, Some(peer)) => transport.read_value(peer, *handle),
        (OperationKind::WriteValue { handle, data }, Some(peer)) => {
            transport.write_value(peer, *handle, data)
        }
        (OperationKind::SetNotifyState { handle, enabled }, Some(peer)) => {
            transport.set_notify_state(peer, *handle, *enabled)
        }
        (OperationKind::ChangeLinkParams(params), Some(peer)) => {
            transport.change_link_params(peer, *params)
        }
        (OperationKind::Bond, Some(peer)) => transport.bond(peer),
        (OperationKind::Unbond, Some(peer)) => transport.unbond(peer),
        (OperationKind::ReadRssi, Some(peer)) => transport.read_rssi(peer),
        (OperationKind::RequestMtu(mtu), Some(peer)) => transport.request_mtu(peer, *mtu),
    }
}
