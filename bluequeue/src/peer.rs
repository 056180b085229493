use std::fmt;

use futures::Stream;

use crate::operation::{Channel, OperationKind, Payload, Priority, ValueHandle};
use crate::session::Session;
use crate::state::PeerState;
use crate::transport::{Capability, LinkParams};
use crate::{Error, Event, PeerId, Result};

// For the public API a Peer is just a thin wrapper over a peer id
// associated with a peer-specific API. Every operation is marshalled onto
// the session's update loop and queued behind whatever else is pending
// for the same peer, so it's fine to issue requests from many tasks at
// once: they'll be dispatched one at a time, in priority order.

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    session: Session,
    id: PeerId,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

// Payloads are tagged by kind so a mismatch means the transport answered
// with the wrong shape
fn unexpected(what: &str, payload: Payload) -> Error {
    Error::Other(anyhow::anyhow!("Expected {} but the transport returned {:?}", what, payload))
}

impl Peer {
    pub(crate) fn new(session: Session, id: PeerId) -> Self {
        Peer { session, id }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn execute(&self, kind: OperationKind, priority: Option<Priority>) -> Result<Payload> {
        self.session.execute(Channel::Peer(self.id.clone()), kind, priority).await
    }

    /// Connects to the peer and, unless disabled in the config, discovers
    /// its capabilities
    ///
    /// The returned future resolves once the link is up; listen for
    /// `PeerState::INITIALIZED` (or check [`Peer::state`]) to know when
    /// discovery has finished too.
    ///
    /// A failed attempt is retried according to the session's retry
    /// policy. In that case the error has `retry_pending` set, and the
    /// eventual result is reported via state changes and
    /// [`Event::PeerGaveUp`](crate::Event::PeerGaveUp).
    ///
    /// Connecting to a peer that is already connected fails immediately
    /// with `FailureReason::AlreadyConnected`.
    pub async fn connect(&self) -> Result<()> {
        self.execute(OperationKind::Connect, None).await?;
        Ok(())
    }

    /// Disconnects, cancelling any connection attempt that is still
    /// pending
    pub async fn disconnect(&self) -> Result<()> {
        self.execute(OperationKind::Disconnect, None).await?;
        Ok(())
    }

    pub async fn discover_capabilities(&self) -> Result<Vec<Capability>> {
        match self.execute(OperationKind::DiscoverCapabilities, None).await? {
            Payload::Capabilities(capabilities) => Ok(capabilities),
            other => Err(unexpected("capabilities", other)),
        }
    }

    pub async fn read_value(&self, handle: ValueHandle) -> Result<Vec<u8>> {
        match self.execute(OperationKind::ReadValue { handle }, None).await? {
            Payload::Value(value) => Ok(value),
            other => Err(unexpected("a value", other)),
        }
    }

    pub async fn write_value(&self, handle: ValueHandle, data: &[u8]) -> Result<()> {
        self.execute(OperationKind::WriteValue { handle, data: data.to_vec() }, None).await?;
        Ok(())
    }

    /// Like `write_value` but jumps ahead of ordinary queued reads and
    /// writes
    pub async fn write_value_with_priority(&self, handle: ValueHandle, data: &[u8],
                                           priority: Priority)
                                           -> Result<()> {
        self.execute(OperationKind::WriteValue { handle, data: data.to_vec() }, Some(priority))
            .await?;
        Ok(())
    }

    pub async fn set_notify_state(&self, handle: ValueHandle, enabled: bool) -> Result<()> {
        self.execute(OperationKind::SetNotifyState { handle, enabled }, None).await?;
        Ok(())
    }

    pub async fn change_link_params(&self, params: LinkParams) -> Result<()> {
        self.execute(OperationKind::ChangeLinkParams(params), None).await?;
        Ok(())
    }

    pub async fn bond(&self) -> Result<()> {
        self.execute(OperationKind::Bond, None).await?;
        Ok(())
    }

    pub async fn unbond(&self) -> Result<()> {
        self.execute(OperationKind::Unbond, None).await?;
        Ok(())
    }

    pub async fn read_rssi(&self) -> Result<i16> {
        match self.execute(OperationKind::ReadRssi, None).await? {
            Payload::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected("an RSSI", other)),
        }
    }

    /// Returns the MTU that was actually negotiated
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        match self.execute(OperationKind::RequestMtu(mtu), None).await? {
            Payload::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected("an MTU", other)),
        }
    }

    /// Cancels everything queued or in flight for this peer
    pub async fn cancel_all(&self) -> Result<usize> {
        self.session.cancel_all(Channel::Peer(self.id.clone())).await
    }

    /// The peer's current state flags
    ///
    /// This API won't initiate any IO. A peer the session has never heard
    /// of is reported as `DISCONNECTED`.
    pub fn state(&self) -> PeerState {
        self.session.peer_state(&self.id).unwrap_or(PeerState::DISCONNECTED)
    }

    pub fn is_connected(&self) -> bool {
        self.state().contains(PeerState::CONNECTED)
    }

    /// Returns the capabilities found by the most recent discovery
    pub fn capabilities(&self) -> Vec<Capability> {
        self.session.capabilities(&self.id).unwrap_or_default()
    }

    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        self.session.peer_events(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeController, FakeTransport, TransportCall};
    use crate::operation::{FailureReason, RequestKind};
    use crate::transport::{CapabilityProperties, LinkPriority};
    use crate::SessionConfig;
    use futures::StreamExt;
    use std::str::FromStr;
    use uuid::Uuid;

    const HEART_RATE: ValueHandle = ValueHandle(12);
    const CONTROL_POINT: ValueHandle = ValueHandle(15);

    async fn connected_peer() -> (Peer, FakeController) {
        let _ = pretty_env_logger::try_init();
        let mut controller = None;
        let session = SessionConfig::new().start(|bus| {
                                              let (transport, fake) = FakeTransport::with_event_bus(bus);
                                              controller = Some(fake);
                                              Ok(transport)
                                          })
                                          .await
                                          .unwrap();
        let controller = controller.unwrap();
        let id = PeerId::from_str("F1:E2:D3:C4:B5:A6").unwrap();
        controller.set_capabilities(&id, vec![
            Capability::new(Uuid::new_v4(), HEART_RATE, CapabilityProperties::NOTIFY),
            Capability::new(Uuid::new_v4(), CONTROL_POINT, CapabilityProperties::WRITE),
        ]);

        let peer = session.peer(id);
        let mut events = Box::pin(peer.events().unwrap());
        peer.connect().await.unwrap();
        while !peer.state().contains(PeerState::INITIALIZED) {
            events.next().await;
        }
        (peer, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_then_use() {
        let (peer, controller) = connected_peer().await;
        assert!(peer.is_connected());
        assert_eq!(peer.capabilities().len(), 2);

        peer.set_notify_state(HEART_RATE, true).await.unwrap();
        peer.write_value(CONTROL_POINT, &[1]).await.unwrap();
        assert_eq!(controller.value(peer.id(), CONTROL_POINT), Some(vec![1]));
        assert_eq!(peer.read_value(CONTROL_POINT).await.unwrap(), vec![1]);
        assert_eq!(peer.read_rssi().await.unwrap(), -60);
        assert_eq!(peer.request_mtu(247).await.unwrap(), 247);
        peer.change_link_params(LinkParams { priority: LinkPriority::High }).await.unwrap();

        let err = peer.connect().await.unwrap_err();
        assert!(matches!(err, Error::Operation(ref f) if f.reason == FailureReason::AlreadyConnected));

        peer.disconnect().await.unwrap();
        assert_eq!(peer.state(), PeerState::DISCONNECTED);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_writes_are_serialized() {
        let (peer, controller) = connected_peer().await;
        let writes = (0..5u8).map(|i| {
            let peer = peer.clone();
            tokio::spawn(async move { peer.write_value(CONTROL_POINT, &[i]).await })
        });
        for write in futures::future::join_all(writes).await {
            write.unwrap().unwrap();
        }
        let written = controller.calls()
                                .into_iter()
                                .filter(|call| call.request_kind() == RequestKind::WriteValue)
                                .count();
        assert_eq!(written, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn bonding() {
        let (peer, controller) = connected_peer().await;
        peer.bond().await.unwrap();
        assert!(peer.state().contains(PeerState::BONDED));
        peer.unbond().await.unwrap();
        assert!(!peer.state().contains(PeerState::BONDED));
        assert_eq!(controller.calls().last(), Some(&TransportCall::Unbond(peer.id().clone())));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_link_loss_reconnects() {
        let (peer, controller) = connected_peer().await;
        let mut events = Box::pin(peer.events().unwrap());
        controller.drop_link(peer.id(), None);

        // Wait for the reconnection and rediscovery to complete
        let mut saw_reconnecting = false;
        loop {
            if let Some(Event::PeerStateChanged(change)) = events.next().await {
                saw_reconnecting |= change.did_enter(PeerState::RECONNECTING);
                if change.did_enter(PeerState::INITIALIZED) {
                    break;
                }
            }
        }
        assert!(saw_reconnecting);
        assert!(!peer.state().contains(PeerState::RECONNECTING));
        assert_eq!(controller.count(RequestKind::Connect), 2);
    }
}
