use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

pub mod operation;
use operation::{OperationFailure, ValueHandle};

pub mod queue;

pub mod scheduler;

pub mod state;
use state::StateChange;

pub mod retry;
use retry::{GiveUpReason, RetryKind};

pub mod transport;

pub mod manager;

pub mod session;

pub mod peer;

pub mod fake;

pub use manager::{Manager, ManagerConfig};
pub use peer::Peer;
pub use session::{Session, SessionConfig};
pub use state::PeerState;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MAC(u64);

impl MAC {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut wide = [0u8; 8];
        wide[..6].copy_from_slice(&bytes);
        MAC(u64::from_le_bytes(wide))
    }
}

impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// Identifies one remote peer
///
/// Most transports expose the hardware MAC address directly, but some
/// platforms only hand out an opaque per-device string, so both forms
/// are accepted. Parsing a `XX:XX:XX:XX:XX:XX` string always yields the
/// `MAC` form so ids read back from storage compare equal to the ids the
/// transport reports.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerId {
    MAC(MAC),
    String(String),
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerId::MAC(mac) => write!(f, "{}", mac),
            PeerId::String(s) => write!(f, "{}", s),
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerId::MAC(mac) => write!(f, "MAC:{}", mac),
            PeerId::String(s) => write!(f, "String:{}", s),
        }
    }
}

// Not public: an id that isn't a MAC is still a valid id, so a parse
// "failure" here just means falling back to the string form.
fn parse_mac48(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<&str, 6>::new();
    for part in s.split(':') {
        parts.try_push(part).ok()?;
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match parse_mac48(s) {
            Some(val) => Ok(PeerId::MAC(MAC(val))),
            None => Ok(PeerId::String(s.to_string())),
        }
    }
}

impl From<MAC> for PeerId {
    fn from(mac: MAC) -> Self {
        PeerId::MAC(mac)
    }
}

#[test]
fn peer_id_two_way() {
    let id = PeerId::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(id, PeerId::MAC(_)));
    // Octets are formatted uppercase so ids round trip through
    // platforms that are picky about address case.
    assert_eq!(id.to_string(), "F1:E2:D3:C4:B5:A6");

    let id = PeerId::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(id, PeerId::String(_)));
    assert_eq!(id.to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");

    let id = PeerId::from_str("F1:E2:D3:C4:B5").unwrap();
    assert!(matches!(id, PeerId::String(_)));
}

#[test]
fn mac_from_bytes_matches_parse() {
    let mac = MAC::from_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    assert_eq!(PeerId::from(mac), PeerId::from_str("01:02:03:04:05:06").unwrap());
}

/// Application-facing notifications
///
/// Delivered through [`Session::events()`] (or a raw
/// `broadcast::Receiver` when driving a [`Manager`] directly).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    /// One or more state flags of a peer were entered or exited
    PeerStateChanged(StateChange),

    /// The retry policy gave up on establishing (or keeping) a usable
    /// connection to a peer, or on bonding with it.
    #[non_exhaustive]
    PeerGaveUp {
        peer: PeerId,
        kind: RetryKind,
        reason: GiveUpReason,
        attempts: u32,
        at: Instant,
    },

    /// Unsolicited value notification; these bypass the scheduler since
    /// they are not a response to any operation.
    #[non_exhaustive]
    ValueChanged {
        peer: PeerId,
        handle: ValueHandle,
        value: Vec<u8>,
    },

    #[non_exhaustive]
    ScanningChanged {
        scanning: bool,
    },

    #[non_exhaustive]
    PeerDiscovered {
        peer: PeerId,
    },
}

impl Event {
    /// The peer this event relates to, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Event::PeerStateChanged(change) => Some(&change.peer),
            Event::PeerGaveUp { peer, .. } => Some(peer),
            Event::ValueChanged { peer, .. } => Some(peer),
            Event::PeerDiscovered { peer } => Some(peer),
            Event::ScanningChanged { .. } => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("The transport refused to start the request: {0}")]
    TransportRejected(String),

    #[error(transparent)]
    Operation(#[from] OperationFailure),

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("The session update loop is no longer running")]
    SessionClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
