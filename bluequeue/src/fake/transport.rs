use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::operation::{Channel, Payload, RequestKind, ValueHandle};
use crate::transport::{BondState, Capability, LinkParams, Transport, TransportEvent,
                       TransportEventSender, TransportFailure};
use crate::{Error, PeerId, Result};

/// A request as it reached the fake transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    StartScanning,
    StopScanning,
    Connect(PeerId),
    Disconnect(PeerId),
    DiscoverCapabilities(PeerId),
    ReadValue(PeerId, ValueHandle),
    WriteValue(PeerId, ValueHandle, Vec<u8>),
    SetNotifyState(PeerId, ValueHandle, bool),
    ChangeLinkParams(PeerId, LinkParams),
    Bond(PeerId),
    Unbond(PeerId),
    ReadRssi(PeerId),
    RequestMtu(PeerId, u16),
}

impl TransportCall {
    pub fn request_kind(&self) -> RequestKind {
        match self {
            TransportCall::StartScanning => RequestKind::StartScan,
            TransportCall::StopScanning => RequestKind::StopScan,
            TransportCall::Connect(_) => RequestKind::Connect,
            TransportCall::Disconnect(_) => RequestKind::Disconnect,
            TransportCall::DiscoverCapabilities(_) => RequestKind::DiscoverCapabilities,
            TransportCall::ReadValue(..) => RequestKind::ReadValue,
            TransportCall::WriteValue(..) => RequestKind::WriteValue,
            TransportCall::SetNotifyState(..) => RequestKind::SetNotifyState,
            TransportCall::ChangeLinkParams(..) => RequestKind::ChangeLinkParams,
            TransportCall::Bond(_) => RequestKind::Bond,
            TransportCall::Unbond(_) => RequestKind::Unbond,
            TransportCall::ReadRssi(_) => RequestKind::ReadRssi,
            TransportCall::RequestMtu(..) => RequestKind::RequestMtu,
        }
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            TransportCall::StartScanning | TransportCall::StopScanning => None,
            TransportCall::Connect(peer) |
            TransportCall::Disconnect(peer) |
            TransportCall::DiscoverCapabilities(peer) |
            TransportCall::ReadValue(peer, _) |
            TransportCall::WriteValue(peer, ..) |
            TransportCall::SetNotifyState(peer, ..) |
            TransportCall::ChangeLinkParams(peer, _) |
            TransportCall::Bond(peer) |
            TransportCall::Unbond(peer) |
            TransportCall::ReadRssi(peer) |
            TransportCall::RequestMtu(peer, _) => Some(peer),
        }
    }
}

// What to do with the next request of a given kind
#[derive(Clone, Debug)]
enum Script {
    Reject,
    Fail(TransportFailure),
    // Accept the request but never answer it
    Ignore,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<TransportCall>,
    scripts: HashMap<RequestKind, VecDeque<Script>>,
    capabilities: HashMap<PeerId, Vec<Capability>>,
    values: HashMap<(PeerId, ValueHandle), Vec<u8>>,
    rssi: i16,
}

/// In-process transport for tests and demos
///
/// Every request is recorded. Without an event bus the fake only records
/// and the test delivers callbacks itself; with one it answers every
/// accepted request straight away unless told otherwise through the
/// [`FakeController`].
///
/// Connect and Disconnect responses are *not* followed by a
/// `LinkStateChanged`: use [`FakeController::drop_link`] and
/// [`FakeController::link_up`] to simulate unsolicited link changes.
#[derive(Debug)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    event_bus: Option<TransportEventSender>,
}

/// Scripts and observes a [`FakeTransport`] after it has been handed over
#[derive(Clone, Debug)]
pub struct FakeController {
    state: Arc<Mutex<FakeState>>,
    event_bus: Option<TransportEventSender>,
}

impl FakeTransport {
    /// A recording-only fake
    pub fn new() -> (FakeTransport, FakeController) {
        Self::build(None)
    }

    /// A fake that answers requests on `event_bus`
    pub fn with_event_bus(event_bus: TransportEventSender) -> (FakeTransport, FakeController) {
        Self::build(Some(event_bus))
    }

    fn build(event_bus: Option<TransportEventSender>) -> (FakeTransport, FakeController) {
        let state = Arc::new(Mutex::new(FakeState { rssi: -60, ..FakeState::default() }));
        (FakeTransport { state: state.clone(), event_bus: event_bus.clone() },
         FakeController { state, event_bus })
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn request(&mut self, call: TransportCall) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = call.request_kind();
        state.calls.push(call.clone());

        let script = state.scripts.get_mut(&kind).and_then(|scripts| scripts.pop_front());
        let result = match script {
            Some(Script::Reject) => {
                trace!("Fake transport rejecting {:?}", call);
                return Err(Error::TransportRejected(format!("{:?} rejected by script", kind)));
            }
            Some(Script::Ignore) => {
                trace!("Fake transport swallowing {:?}", call);
                return Ok(());
            }
            Some(Script::Fail(failure)) => Err(failure),
            None => Ok(respond(&mut state, &call)),
        };

        if let Some(bus) = &self.event_bus {
            let channel = match call.peer() {
                Some(peer) => Channel::Peer(peer.clone()),
                None => Channel::Manager,
            };
            // A closed bus just means nobody is listening any more
            let _ = bus.send(TransportEvent::Completed { channel, kind, result });
        }
        Ok(())
    }
}

fn respond(state: &mut FakeState, call: &TransportCall) -> Payload {
    match call {
        TransportCall::DiscoverCapabilities(peer) => {
            Payload::Capabilities(state.capabilities.get(peer).cloned().unwrap_or_default())
        }
        TransportCall::ReadValue(peer, handle) => {
            Payload::Value(state.values.get(&(peer.clone(), *handle)).cloned().unwrap_or_default())
        }
        TransportCall::WriteValue(peer, handle, data) => {
            state.values.insert((peer.clone(), *handle), data.clone());
            Payload::None
        }
        TransportCall::ReadRssi(_) => Payload::Rssi(state.rssi),
        TransportCall::RequestMtu(_, mtu) => Payload::Mtu(*mtu),
        _ => Payload::None,
    }
}

impl Transport for FakeTransport {
    fn start_scanning(&mut self) -> Result<()> {
        self.request(TransportCall::StartScanning)
    }
    fn stop_scanning(&mut self) -> Result<()> {
        self.request(TransportCall::StopScanning)
    }

    fn connect(&mut self, peer: &PeerId) -> Result<()> {
        self.request(TransportCall::Connect(peer.clone()))
    }
    fn disconnect(&mut self, peer: &PeerId) -> Result<()> {
        self.request(TransportCall::Disconnect(peer.clone()))
    }

    fn discover_capabilities(&mut self, peer: &PeerId) -> Result<()> {
        self.request(TransportCall::DiscoverCapabilities(peer.clone()))
    }

    fn read_value(&mut self, peer: &PeerId, handle: ValueHandle) -> Result<()> {
        self.request(TransportCall::ReadValue(peer.clone(), handle))
    }
    fn write_value(&mut self, peer: &PeerId, handle: ValueHandle, data: &[u8]) -> Result<()> {
        self.request(TransportCall::WriteValue(peer.clone(), handle, data.to_vec()))
    }
    fn set_notify_state(&mut self, peer: &PeerId, handle: ValueHandle, enabled: bool)
                        -> Result<()> {
        self.request(TransportCall::SetNotifyState(peer.clone(), handle, enabled))
    }

    fn change_link_params(&mut self, peer: &PeerId, params: LinkParams) -> Result<()> {
        self.request(TransportCall::ChangeLinkParams(peer.clone(), params))
    }

    fn bond(&mut self, peer: &PeerId) -> Result<()> {
        self.request(TransportCall::Bond(peer.clone()))
    }
    fn unbond(&mut self, peer: &PeerId) -> Result<()> {
        self.request(TransportCall::Unbond(peer.clone()))
    }

    fn read_rssi(&mut self, peer: &PeerId) -> Result<()> {
        self.request(TransportCall::ReadRssi(peer.clone()))
    }
    fn request_mtu(&mut self, peer: &PeerId, mtu: u16) -> Result<()> {
        self.request(TransportCall::RequestMtu(peer.clone(), mtu))
    }
}

impl FakeController {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// How many requests of `kind` have reached the transport so far
    pub fn count(&self, kind: RequestKind) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|call| call.request_kind() == kind).count()
    }

    fn script(&self, kind: RequestKind, script: Script) {
        self.state.lock().unwrap().scripts.entry(kind).or_default().push_back(script);
    }

    /// Refuse the next request of `kind` outright
    pub fn reject_next(&self, kind: RequestKind) {
        self.script(kind, Script::Reject);
    }

    /// Accept the next request of `kind` but answer it with `failure`
    pub fn fail_next(&self, kind: RequestKind, failure: TransportFailure) {
        self.script(kind, Script::Fail(failure));
    }

    /// Accept the next request of `kind` and never answer it
    pub fn ignore_next(&self, kind: RequestKind) {
        self.script(kind, Script::Ignore);
    }

    pub fn set_capabilities(&self, peer: &PeerId, capabilities: Vec<Capability>) {
        self.state.lock().unwrap().capabilities.insert(peer.clone(), capabilities);
    }

    pub fn set_value(&self, peer: &PeerId, handle: ValueHandle, value: Vec<u8>) {
        self.state.lock().unwrap().values.insert((peer.clone(), handle), value);
    }

    pub fn value(&self, peer: &PeerId, handle: ValueHandle) -> Option<Vec<u8>> {
        self.state.lock().unwrap().values.get(&(peer.clone(), handle)).cloned()
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.state.lock().unwrap().rssi = rssi;
    }

    fn send(&self, event: TransportEvent) {
        match &self.event_bus {
            Some(bus) => {
                let _ = bus.send(event);
            }
            None => trace!("Fake transport has no event bus, dropping {:?}", event),
        }
    }

    pub fn discover(&self, peer: &PeerId) {
        self.send(TransportEvent::PeerDiscovered { peer: peer.clone() });
    }

    pub fn drop_link(&self, peer: &PeerId, error: Option<TransportFailure>) {
        self.send(TransportEvent::LinkStateChanged { peer: peer.clone(), connected: false, error });
    }

    pub fn link_up(&self, peer: &PeerId) {
        self.send(TransportEvent::LinkStateChanged { peer: peer.clone(), connected: true, error: None });
    }

    pub fn bond_state(&self, peer: &PeerId, state: BondState) {
        self.send(TransportEvent::BondStateChanged { peer: peer.clone(), state });
    }

    pub fn notify(&self, peer: &PeerId, handle: ValueHandle, value: Vec<u8>) {
        self.send(TransportEvent::ValueChanged { peer: peer.clone(), handle, value });
    }
}
