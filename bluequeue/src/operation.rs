use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::transport::{Capability, LinkParams, TransportFailure};
use crate::PeerId;

/// Monotonic operation identity, never reused within a `Scheduler`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Transport-level handle of a readable/writable value on a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueHandle(pub u32);

/// A single-flight execution slot
///
/// Each peer has its own channel and there's one extra channel for
/// operations on the shared transceiver itself (e.g. scanning).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Manager,
    Peer(PeerId),
}

impl Channel {
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Channel::Manager => None,
            Channel::Peer(peer) => Some(peer),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Channel::Manager => write!(f, "manager"),
            Channel::Peer(peer) => write!(f, "{}", peer),
        }
    }
}

impl From<PeerId> for Channel {
    fn from(peer: PeerId) -> Self {
        Channel::Peer(peer)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Disconnect,
    DiscoverCapabilities,
    ReadValue { handle: ValueHandle },
    WriteValue { handle: ValueHandle, data: Vec<u8> },
    SetNotifyState { handle: ValueHandle, enabled: bool },
    ChangeLinkParams(LinkParams),
    StartScan,
    StopScan,
    Bond,
    Unbond,
    ReadRssi,
    RequestMtu(u16),
}

/// Payload-free discriminant of an [`OperationKind`]
///
/// Transports report this with every completion to say which *type* of
/// callback fired. It is not a request id: two reads on the same peer
/// produce indistinguishable completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Connect,
    Disconnect,
    DiscoverCapabilities,
    ReadValue,
    WriteValue,
    SetNotifyState,
    ChangeLinkParams,
    StartScan,
    StopScan,
    Bond,
    Unbond,
    ReadRssi,
    RequestMtu,
}

impl OperationKind {
    pub fn request_kind(&self) -> RequestKind {
        match self {
            OperationKind::Connect => RequestKind::Connect,
            OperationKind::Disconnect => RequestKind::Disconnect,
            OperationKind::DiscoverCapabilities => RequestKind::DiscoverCapabilities,
            OperationKind::ReadValue { .. } => RequestKind::ReadValue,
            OperationKind::WriteValue { .. } => RequestKind::WriteValue,
            OperationKind::SetNotifyState { .. } => RequestKind::SetNotifyState,
            OperationKind::ChangeLinkParams(_) => RequestKind::ChangeLinkParams,
            OperationKind::StartScan => RequestKind::StartScan,
            OperationKind::StopScan => RequestKind::StopScan,
            OperationKind::Bond => RequestKind::Bond,
            OperationKind::Unbond => RequestKind::Unbond,
            OperationKind::ReadRssi => RequestKind::ReadRssi,
            OperationKind::RequestMtu(_) => RequestKind::RequestMtu,
        }
    }

    /// Whether this kind runs on the manager-global channel rather than
    /// a peer channel
    pub fn is_global(&self) -> bool {
        matches!(self, OperationKind::StartScan | OperationKind::StopScan)
    }

    /// Whether this kind can only go out over a live link
    ///
    /// Such operations wait in the queue while a connection is being
    /// (re)established and fail with `FailureReason::NotConnected` once
    /// there's no link and none coming.
    pub fn requires_connection(&self) -> bool {
        matches!(self,
                 OperationKind::DiscoverCapabilities |
                 OperationKind::ReadValue { .. } |
                 OperationKind::WriteValue { .. } |
                 OperationKind::SetNotifyState { .. } |
                 OperationKind::ChangeLinkParams(_) |
                 OperationKind::ReadRssi |
                 OperationKind::RequestMtu(_))
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            OperationKind::StartScan | OperationKind::StopScan => Priority::Trivial,
            OperationKind::Connect | OperationKind::DiscoverCapabilities |
            OperationKind::Bond | OperationKind::Unbond => Priority::Medium,
            OperationKind::Disconnect => Priority::Critical,
            _ => Priority::Low,
        }
    }
}

/// Scheduling class; higher classes are dispatched first on a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Scanning
    Trivial,
    /// Ordinary reads and writes
    Low,
    /// Explicit connecting, bonding and priority data operations
    Medium,
    /// Implicit connection work: auto-reconnect and auto-discovery
    High,
    /// Teardown; never starved behind a slow read
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Application,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport refused to even start the request
    Rejected(String),
    /// No callback arrived within the operation's timeout
    TimedOut,
    /// The callback arrived with a non-success status
    Reported(TransportFailure),
    Cancelled,
    /// The link dropped without the application asking for it
    LinkLost,
    AlreadyConnected,
    /// The operation needs a link and the peer has none
    NotConnected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureReason::Rejected(why) => write!(f, "rejected by transport ({})", why),
            FailureReason::TimedOut => write!(f, "timed out"),
            FailureReason::Reported(failure) => write!(f, "transport reported failure: {}", failure),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::LinkLost => write!(f, "link lost"),
            FailureReason::AlreadyConnected => write!(f, "already connected"),
            FailureReason::NotConnected => write!(f, "not connected"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    Queued,
    Dispatched,
    Succeeded,
    Failed(FailureReason),
    TimedOut,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Queued | OperationStatus::Dispatched)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    None,
    Capabilities(Vec<Capability>),
    Value(Vec<u8>),
    Rssi(i16),
    Mtu(u16),
}

/// The tagged failure handed to a completion callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationFailure {
    pub reason: FailureReason,
    pub attempt: u32,
    /// Set when the retry policy has already queued another attempt; the
    /// final result of that attempt is reported through state changes and
    /// `Event::PeerGaveUp`, not through this completion.
    pub retry_pending: bool,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (attempt {}", self.reason, self.attempt)?;
        if self.retry_pending {
            write!(f, ", retrying")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for OperationFailure {}

pub type Outcome = std::result::Result<Payload, OperationFailure>;

/// Invoked exactly once when the operation is retired
pub type Completion = Box<dyn FnOnce(Outcome) + Send + 'static>;

pub struct Operation {
    pub(crate) id: OpId,
    pub(crate) target: Channel,
    pub(crate) kind: OperationKind,
    pub(crate) priority: Priority,
    pub(crate) origin: Origin,
    pub(crate) attempt: u32,
    pub(crate) created_at: Instant,
    pub(crate) not_before: Option<Instant>,
    pub(crate) dispatched_at: Option<Instant>,
    pub(crate) timeout: Duration,
    pub(crate) status: OperationStatus,
    pub(crate) completion: Option<Completion>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("kind", &self.kind.request_kind())
            .field("priority", &self.priority)
            .field("origin", &self.origin)
            .field("attempt", &self.attempt)
            .field("status", &self.status)
            .finish()
    }
}

impl Operation {
    pub(crate) fn new(id: OpId, target: Channel, kind: OperationKind, now: Instant,
                      timeout: Duration) -> Self {
        let priority = kind.default_priority();
        Operation {
            id,
            target,
            kind,
            priority,
            origin: Origin::Application,
            attempt: 1,
            created_at: now,
            not_before: None,
            dispatched_at: None,
            timeout,
            status: OperationStatus::Queued,
            completion: None,
        }
    }

    pub(crate) fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn with_completion(mut self, completion: Option<Completion>) -> Self {
        self.completion = completion;
        self
    }

    pub(crate) fn internal(mut self, attempt: u32, not_before: Option<Instant>) -> Self {
        self.origin = Origin::Internal;
        self.attempt = attempt;
        self.not_before = not_before;
        self
    }

    pub fn id(&self) -> OpId {
        self.id
    }
    pub fn target(&self) -> &Channel {
        &self.target
    }
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }
    pub fn priority(&self) -> Priority {
        self.priority
    }
    pub fn origin(&self) -> Origin {
        self.origin
    }
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
    pub fn dispatched_at(&self) -> Option<Instant> {
        self.dispatched_at
    }
    pub fn status(&self) -> &OperationStatus {
        &self.status
    }

    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        match self.not_before {
            Some(not_before) => now >= not_before,
            None => true,
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.dispatched_at.map(|at| at + self.timeout)
    }

    /// Hands the completion to `outcome`, at most once over the whole
    /// lifetime of the operation.
    pub(crate) fn complete(&mut self, outcome: Outcome) {
        match self.completion.take() {
            Some(completion) => completion(outcome),
            None => log::trace!("{} retired without a completion", self.id),
        }
    }
}
