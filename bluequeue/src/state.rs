use std::collections::HashMap;
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, error};

use crate::{Error, PeerId, Result};

bitflags! {
    /// The set of conditions currently true for a peer
    ///
    /// A set rather than a single enum: connection and
    /// bonding progress independently, and a peer can be `BONDED` while
    /// `DISCONNECTED` or still `BONDING` after its link dropped.
    pub struct PeerState: u32 {
        const DISCONNECTED = 0x001;
        const CONNECTING = 0x002;
        /// Spans every retry of a connection attempt, from the first
        /// Connect until the peer is `INITIALIZED` or we give up
        const CONNECTING_OVERALL = 0x004;
        const CONNECTED = 0x008;
        const DISCOVERING_CAPABILITIES = 0x010;
        /// Capabilities are known and the peer is ready for use
        const INITIALIZED = 0x020;
        const BONDING = 0x040;
        const BONDED = 0x080;
        const RECONNECTING = 0x100;
    }
}

impl PeerState {
    /// Flags that only make sense while a link is up
    pub const LINK_DEPENDENT: PeerState = PeerState {
        bits: PeerState::CONNECTED.bits | PeerState::INITIALIZED.bits |
              PeerState::DISCOVERING_CAPABILITIES.bits,
    };

    /// Flags that describe connection work still in progress
    pub const PENDING_CONNECTION: PeerState = PeerState {
        bits: PeerState::CONNECTING.bits | PeerState::CONNECTING_OVERALL.bits |
              PeerState::RECONNECTING.bits,
    };

    /// Iterates over the individual flags set in `self`
    pub fn flags(self) -> impl Iterator<Item = PeerState> {
        (0..32).map(|bit| 1u32 << bit)
               .filter_map(PeerState::from_bits)
               .filter(move |flag| !flag.is_empty() && self.contains(*flag))
    }
}

/// A single observed transition of a peer's flag set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub peer: PeerId,
    pub entered: PeerState,
    pub exited: PeerState,
    /// The complete flag set after the transition
    pub state: PeerState,
    pub at: Instant,
}

impl StateChange {
    pub fn did_enter(&self, flag: PeerState) -> bool {
        self.entered.contains(flag)
    }
    pub fn did_exit(&self, flag: PeerState) -> bool {
        self.exited.contains(flag)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlagTimes {
    pub entered_at: Option<Instant>,
    pub exited_at: Option<Instant>,
}

#[derive(Debug)]
pub struct PeerStateMachine {
    peer: PeerId,
    state: PeerState,
    times: HashMap<PeerState, FlagTimes>,
}

impl PeerStateMachine {
    pub fn new(peer: PeerId, now: Instant) -> Self {
        let mut times = HashMap::new();
        times.insert(PeerState::DISCONNECTED, FlagTimes { entered_at: Some(now), exited_at: None });
        PeerStateMachine {
            peer,
            state: PeerState::DISCONNECTED,
            times,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is(&self, flags: PeerState) -> bool {
        self.state.contains(flags)
    }

    pub fn is_any(&self, flags: PeerState) -> bool {
        self.state.intersects(flags)
    }

    /// Entry/exit timestamps of a single flag
    pub fn times(&self, flag: PeerState) -> FlagTimes {
        self.times.get(&flag).copied().unwrap_or_default()
    }

    /// Enters `enter` and exits `exit` as one atomic transition
    ///
    /// Entering `CONNECTED` implicitly exits `DISCONNECTED` and entering
    /// `DISCONNECTED` implicitly exits everything that needs a link. A
    /// transition that would leave `INITIALIZED` set without `CONNECTED`
    /// is refused and the state is left untouched.
    ///
    /// Returns `None` when nothing actually changed.
    pub fn apply(&mut self, enter: PeerState, exit: PeerState, now: Instant)
                 -> Result<Option<StateChange>> {
        if enter.contains(PeerState::CONNECTED | PeerState::DISCONNECTED) {
            error!("{}: asked to enter both connected and disconnected", self.peer);
            return Err(Error::InvariantViolation(format!("{} would be both connected and disconnected",
                                                         self.peer)));
        }

        let old = self.state;
        let mut new = (old - exit) | enter;

        if enter.contains(PeerState::CONNECTED) {
            new.remove(PeerState::DISCONNECTED);
        }
        if enter.contains(PeerState::DISCONNECTED) {
            new.remove(PeerState::LINK_DEPENDENT);
        }

        if new.contains(PeerState::CONNECTED | PeerState::DISCONNECTED) {
            error!("{}: refusing transition to {:?}: connected and disconnected", self.peer, new);
            return Err(Error::InvariantViolation(format!("{} would be both connected and disconnected",
                                                         self.peer)));
        }
        if new.contains(PeerState::INITIALIZED) && !new.contains(PeerState::CONNECTED) {
            error!("{}: refusing transition to {:?}: initialized without a connection", self.peer, new);
            return Err(Error::InvariantViolation(format!("{} would be initialized while not connected",
                                                         self.peer)));
        }

        let entered = new - old;
        let exited = old - new;
        if entered.is_empty() && exited.is_empty() {
            return Ok(None);
        }

        for flag in entered.flags() {
            self.times.entry(flag).or_default().entered_at = Some(now);
        }
        for flag in exited.flags() {
            self.times.entry(flag).or_default().exited_at = Some(now);
        }
        self.state = new;

        debug!("{}: {:?} (+{:?} -{:?})", self.peer, new, entered, exited);
        Ok(Some(StateChange {
            peer: self.peer.clone(),
            entered,
            exited,
            state: new,
            at: now,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    fn machine(now: Instant) -> PeerStateMachine {
        PeerStateMachine::new(PeerId::from_str("00:11:22:33:44:55").unwrap(), now)
    }

    #[test]
    fn starts_disconnected() {
        let now = Instant::now();
        let psm = machine(now);
        assert_eq!(psm.state(), PeerState::DISCONNECTED);
        assert_eq!(psm.times(PeerState::DISCONNECTED).entered_at, Some(now));
    }

    #[test]
    fn connecting_to_initialized() {
        let t0 = Instant::now();
        let mut psm = machine(t0);

        let change = psm.apply(PeerState::CONNECTING | PeerState::CONNECTING_OVERALL,
                               PeerState::DISCONNECTED, t0).unwrap().unwrap();
        assert!(change.did_enter(PeerState::CONNECTING));
        assert!(change.did_exit(PeerState::DISCONNECTED));

        let t1 = t0 + Duration::from_millis(10);
        let change = psm.apply(PeerState::CONNECTED, PeerState::CONNECTING, t1).unwrap().unwrap();
        assert_eq!(change.state, PeerState::CONNECTED | PeerState::CONNECTING_OVERALL);
        assert_eq!(psm.times(PeerState::CONNECTING).exited_at, Some(t1));

        psm.apply(PeerState::INITIALIZED, PeerState::CONNECTING_OVERALL, t1).unwrap();
        assert_eq!(psm.state(), PeerState::CONNECTED | PeerState::INITIALIZED);
    }

    #[test]
    fn disconnect_clears_link_dependent_flags_but_not_bond() {
        let now = Instant::now();
        let mut psm = machine(now);
        psm.apply(PeerState::CONNECTED | PeerState::BONDED, PeerState::empty(), now).unwrap();
        psm.apply(PeerState::INITIALIZED, PeerState::empty(), now).unwrap();

        let change = psm.apply(PeerState::DISCONNECTED, PeerState::empty(), now).unwrap().unwrap();
        assert_eq!(change.exited, PeerState::CONNECTED | PeerState::INITIALIZED);
        assert_eq!(psm.state(), PeerState::DISCONNECTED | PeerState::BONDED);
    }

    #[test]
    fn initialized_requires_connected() {
        let now = Instant::now();
        let mut psm = machine(now);
        let err = psm.apply(PeerState::INITIALIZED, PeerState::empty(), now).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(psm.state(), PeerState::DISCONNECTED);
    }

    #[test]
    fn connected_and_disconnected_never_coexist() {
        let now = Instant::now();
        let mut psm = machine(now);
        psm.apply(PeerState::CONNECTED, PeerState::empty(), now).unwrap();
        assert!(!psm.is(PeerState::DISCONNECTED));
        assert!(psm.apply(PeerState::CONNECTED | PeerState::DISCONNECTED, PeerState::empty(), now)
                   .is_err());
    }

    #[test]
    fn no_op_transition_reports_nothing() {
        let now = Instant::now();
        let mut psm = machine(now);
        assert!(psm.apply(PeerState::DISCONNECTED, PeerState::CONNECTED, now).unwrap().is_none());
    }

    #[test]
    fn flags_iterates_single_bits() {
        let set = PeerState::CONNECTED | PeerState::BONDING;
        let flags: Vec<PeerState> = set.flags().collect();
        assert_eq!(flags, vec![PeerState::CONNECTED, PeerState::BONDING]);
    }
}
