use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::operation::{Channel, Payload, RequestKind, ValueHandle};
use crate::{PeerId, Result};

/// The bus a transport uses to report completions and unsolicited events
///
/// One end is handed to the transport when it is created and the other
/// end is drained by the session's update loop, so a transport never
/// calls back into scheduler state directly.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// The status a transport reports when an accepted request fails
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportFailure {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Pairing rejected by the peer")]
    PairingRejected,

    #[error("Congested")]
    Congested,

    #[error("Status code {0}")]
    Status(i32),
}

bitflags! {
    pub struct CapabilityProperties: u32 {
        const NONE = 0;

        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
    }
}

/// One addressable endpoint discovered on a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub uuid: Uuid,
    pub handle: ValueHandle,
    pub properties: CapabilityProperties,
}

impl Capability {
    pub fn new(uuid: Uuid, handle: ValueHandle, properties: CapabilityProperties) -> Self {
        Capability { uuid, handle, properties }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkPriority {
    Balanced,
    High,
    LowPower,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParams {
    pub priority: LinkPriority,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The single response to a previously accepted request on `channel`
    ///
    /// `kind` says which type of callback fired; the transport has no way
    /// to say *which* request it answers, so the scheduler correlates by
    /// channel.
    Completed {
        channel: Channel,
        kind: RequestKind,
        result: std::result::Result<Payload, TransportFailure>,
    },
    LinkStateChanged {
        peer: PeerId,
        connected: bool,
        error: Option<TransportFailure>,
    },
    BondStateChanged {
        peer: PeerId,
        state: BondState,
    },
    ValueChanged {
        peer: PeerId,
        handle: ValueHandle,
        value: Vec<u8>,
    },
    PeerDiscovered {
        peer: PeerId,
    },
}

/// The raw, order-sensitive transport API
///
/// Every request is non-blocking: returning `Err` means the request was
/// refused outright and no callback will follow, returning `Ok(())` means
/// exactly one `TransportEvent::Completed` will eventually be sent for it
/// (or never, if the transport misbehaves, in which case the scheduler
/// times it out).
///
/// Requests are only ever issued from the update loop and never more than
/// one at a time per channel.
pub trait Transport: Send {
    fn start_scanning(&mut self) -> Result<()>;
    fn stop_scanning(&mut self) -> Result<()>;

    fn connect(&mut self, peer: &PeerId) -> Result<()>;
    fn disconnect(&mut self, peer: &PeerId) -> Result<()>;

    fn discover_capabilities(&mut self, peer: &PeerId) -> Result<()>;

    fn read_value(&mut self, peer: &PeerId, handle: ValueHandle) -> Result<()>;
    fn write_value(&mut self, peer: &PeerId, handle: ValueHandle, data: &[u8]) -> Result<()>;
    fn set_notify_state(&mut self, peer: &PeerId, handle: ValueHandle, enabled: bool)
                        -> Result<()>;

    fn change_link_params(&mut self, peer: &PeerId, params: LinkParams) -> Result<()>;

    fn bond(&mut self, peer: &PeerId) -> Result<()>;
    fn unbond(&mut self, peer: &PeerId) -> Result<()>;

    fn read_rssi(&mut self, peer: &PeerId) -> Result<()>;
    fn request_mtu(&mut self, peer: &PeerId, mtu: u16) -> Result<()>;
}
