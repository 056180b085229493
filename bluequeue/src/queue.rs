use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::operation::{Channel, OpId, Operation, OperationStatus, RequestKind};
use crate::{Error, Result};

// A slot whose dispatched operation was cancelled or timed out. We still
// expect the transport to eventually deliver that operation's callback so
// until it arrives (or we stop waiting for it) we won't dispatch another
// request of the same kind: the callback would be indistinguishable from
// the new request's response.
#[derive(Clone, Debug)]
struct Draining {
    op: OpId,
    kind: RequestKind,
    deadline: Instant,
}

/// The single-flight slot of one channel plus the operations waiting for it
///
/// Waiting operations are kept sorted by priority (highest first) and by
/// enqueue order within a priority.
#[derive(Debug)]
pub struct ChannelQueue {
    channel: Channel,
    pending: VecDeque<Operation>,
    in_flight: Option<Operation>,
    draining: Vec<Draining>,
}

impl ChannelQueue {
    pub(crate) fn new(channel: Channel) -> Self {
        ChannelQueue {
            channel,
            pending: VecDeque::new(),
            in_flight: None,
            draining: vec![],
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn in_flight(&self) -> Option<&Operation> {
        self.in_flight.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub(crate) fn push(&mut self, op: Operation) {
        // Walk back from the tail since the common case is appending an op
        // of the same or lower priority than everything already queued
        let mut index = self.pending.len();
        while index > 0 && self.pending[index - 1].priority < op.priority {
            index -= 1;
        }
        trace!("{}: queued {} ({:?}) at position {}", self.channel, op.id, op.kind.request_kind(), index);
        self.pending.insert(index, op);
    }

    fn is_blocked(&self, kind: RequestKind) -> bool {
        self.draining.iter().any(|d| d.kind == kind)
    }

    /// Removes and returns the earliest queued operation that may be
    /// dispatched now
    ///
    /// Without a link only operations that don't need one are eligible.
    pub(crate) fn pop_eligible(&mut self, now: Instant, connected: bool) -> Option<Operation> {
        let index = self.pending.iter().position(|op| {
                                           op.is_ready(now) &&
                                           (connected || !op.kind.requires_connection()) &&
                                           !self.is_blocked(op.kind.request_kind())
                                       })?;
        self.pending.remove(index)
    }

    /// Installs `op` as the dispatched operation of this channel
    ///
    /// Two dispatched operations on one channel would make every later
    /// callback ambiguous, so this is refused rather than tolerated.
    pub(crate) fn begin(&mut self, mut op: Operation, now: Instant) -> Result<()> {
        if let Some(current) = &self.in_flight {
            error!("{}: refusing to dispatch {} while {} is still in flight",
                   self.channel, op.id, current.id);
            let err = Error::InvariantViolation(format!("{} dispatched while {} in flight on {}",
                                                        op.id, current.id, self.channel));
            // Put it back at the front so nothing is lost
            self.pending.push_front(op);
            return Err(err);
        }
        op.status = OperationStatus::Dispatched;
        op.dispatched_at = Some(now);
        self.in_flight = Some(op);
        Ok(())
    }

    /// Takes the in-flight operation if it answers to a `kind` callback
    pub(crate) fn take_matching(&mut self, kind: RequestKind) -> Option<Operation> {
        match &self.in_flight {
            Some(op) if op.kind.request_kind() == kind => self.in_flight.take(),
            _ => None,
        }
    }

    /// Takes back an operation the transport refused to start
    pub(crate) fn take_in_flight(&mut self) -> Option<Operation> {
        self.in_flight.take()
    }

    /// Consumes the oldest draining entry that a late `kind` callback
    /// belongs to, returning the id of the cancelled operation
    pub(crate) fn absorb_stale(&mut self, kind: RequestKind) -> Option<OpId> {
        let index = self.draining.iter().position(|d| d.kind == kind)?;
        Some(self.draining.remove(index).op)
    }

    /// Takes the in-flight operation once its timeout has passed
    ///
    /// Its kind then drains for `grace` (or the operation's own timeout)
    /// in case the answer is merely late.
    pub(crate) fn take_expired(&mut self, now: Instant, grace: Option<Duration>) -> Option<Operation> {
        let expired = match self.in_flight.as_ref().and_then(|op| op.deadline()) {
            Some(deadline) => now >= deadline,
            None => false,
        };
        if !expired {
            return None;
        }
        let op = self.in_flight.take()?;
        self.draining.push(Draining {
            op: op.id,
            kind: op.kind.request_kind(),
            deadline: now + grace.unwrap_or(op.timeout),
        });
        Some(op)
    }

    pub(crate) fn expire_draining(&mut self, now: Instant) {
        let channel = &self.channel;
        self.draining.retain(|d| {
            let keep = now < d.deadline;
            if !keep {
                trace!("{}: gave up waiting for the late callback of {}", channel, d.op);
            }
            keep
        });
    }

    /// Removes every queued operation matching `predicate` and, if it also
    /// matches, the in-flight one (which then starts draining)
    pub(crate) fn drain_matching<F>(&mut self, now: Instant, mut predicate: F) -> Vec<Operation>
        where F: FnMut(&Operation) -> bool
    {
        let mut removed = vec![];
        if let Some(op) = &self.in_flight {
            if predicate(op) {
                if let Some(op) = self.in_flight.take() {
                    self.draining.push(Draining {
                        op: op.id,
                        kind: op.kind.request_kind(),
                        deadline: op.deadline().unwrap_or(now),
                    });
                    removed.push(op);
                }
            }
        }
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for op in self.pending.drain(..) {
            if predicate(&op) {
                removed.push(op);
            } else {
                kept.push_back(op);
            }
        }
        self.pending = kept;
        removed
    }
}
