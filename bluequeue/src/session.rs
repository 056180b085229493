use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::{Stream, StreamExt};
use log::{trace, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use crate::manager::{Manager, ManagerConfig, SharedState};
use crate::operation::{Channel, Completion, OperationKind, Outcome, Payload, Priority};
use crate::peer::Peer;
use crate::retry::RetryPolicy;
use crate::state::PeerState;
use crate::transport::{Capability, Transport, TransportEvent, TransportEventSender};
use crate::{Error, Event, PeerId, Result};

// Application requests, marshalled onto the update loop
enum Command {
    Execute {
        target: Channel,
        kind: OperationKind,
        priority: Option<Priority>,
        reply: oneshot::Sender<Result<Payload>>,
    },
    CancelAll {
        target: Channel,
        reply: oneshot::Sender<usize>,
    },
    RemovePeer {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peers", &self.shared.peers.len())
            .field("scanning", &self.is_scanning())
            .finish()
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for SessionInner
// we don't really leak anything
pub struct SessionInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,

    // Requests for the update loop. The loop owns the Manager (and so
    // every queue, state machine and retry context) and exits once the
    // last Session referencing this sender is dropped.
    commands: mpsc::UnboundedSender<Command>,

    // Peer snapshots maintained by the update loop so that state can be
    // read synchronously without a round trip through the loop
    shared: Arc<SharedState>,

    config: ManagerConfig,
}

pub struct SessionConfig {
    config: ManagerConfig,
    retry_policy: Option<Box<dyn RetryPolicy>>,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            config: ManagerConfig::default(),
            retry_policy: None,
        }
    }

    pub fn set_config(&mut self, config: ManagerConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn set_tick_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.tick_interval = interval;
        self
    }

    /// Replaces the default policy built from `ManagerConfig::retry`
    pub fn set_retry_policy(&mut self, policy: Box<dyn RetryPolicy>) -> &mut Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Creates the transport and spawns the update loop
    ///
    /// `make_transport` is handed the sending end of the transport event
    /// bus: every completion and unsolicited event must be sent on it.
    pub async fn start<T, F>(self, make_transport: F) -> Result<Session>
        where T: Transport + 'static,
              F: FnOnce(TransportEventSender) -> Result<T>
    {
        Session::start(self, make_transport).await
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

// The loop's notion of time follows tokio's clock so that tests can run
// with paused time
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Session {
    async fn start<T, F>(config: SessionConfig, make_transport: F) -> Result<Self>
        where T: Transport + 'static,
              F: FnOnce(TransportEventSender) -> Result<T>
    {
        // The transport is responsible for feeding the transport event bus
        // and the update loop turns those events into state changes and
        // forwards corresponding events to the application
        let (transport_bus_tx, transport_bus_rx) = mpsc::unbounded_channel();
        let transport = make_transport(transport_bus_tx)?;

        let mut manager = Manager::new(config.config.clone(), Box::new(transport));
        if let Some(policy) = config.retry_policy {
            manager.set_retry_policy(policy);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = Session { inner: Arc::new(SessionInner { event_bus: manager.event_bus(),
                                                               commands: commands_tx,
                                                               shared: manager.shared(),
                                                               config: config.config }) };

        let tick_interval = session.config.tick_interval;
        tokio::spawn(async move {
            Session::run_update_loop(manager, commands_rx, transport_bus_rx, tick_interval).await
        });

        Ok(session)
    }

    async fn run_update_loop(mut manager: Manager,
                             mut commands: mpsc::UnboundedReceiver<Command>,
                             mut transport_bus: mpsc::UnboundedReceiver<TransportEvent>,
                             tick_interval: Duration) {
        trace!("Starting update loop...");

        let mut ticker = tokio::time::interval(tick_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Session::handle_command(&mut manager, command),
                    None => {
                        trace!("Exiting update loop since the Session has been dropped");
                        break;
                    }
                },
                Some(event) = transport_bus.recv() => {
                    manager.on_transport_event(event, now());
                }
                _ = ticker.tick() => {}
            }

            // Dispatch anything that was freed up straight away rather than
            // waiting for the next tick
            manager.tick(now());
        }

        trace!("Finished update loop");
    }

    fn handle_command(manager: &mut Manager, command: Command) {
        match command {
            Command::Execute { target, kind, priority, reply } => {
                // Rejections are reported here since a completion that never
                // got queued is dropped without running
                if let Err(err) = manager.scheduler().check_target(&target, &kind) {
                    let _ = reply.send(Err(err));
                    return;
                }
                let completion: Completion = Box::new(move |outcome: Outcome| {
                    let _ = reply.send(outcome.map_err(Error::from));
                });
                if let Err(err) = manager.enqueue(target, kind, priority, Some(completion), now()) {
                    warn!("Failed to queue operation: {}", err);
                }
            }
            Command::CancelAll { target, reply } => {
                let _ = reply.send(manager.cancel_all(&target, now()));
            }
            Command::RemovePeer { peer, reply } => {
                manager.remove_peer(&peer, now());
                let _ = reply.send(());
            }
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::SessionClosed)
    }

    /// Queues an operation and waits for its outcome
    ///
    /// A `priority` of `None` uses the default for `kind`.
    pub async fn execute(&self, target: Channel, kind: OperationKind, priority: Option<Priority>)
                         -> Result<Payload> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::Execute { target, kind, priority, reply })?;
        outcome.await.map_err(|_| Error::SessionClosed)?
    }

    /// Cancels every queued and in-flight operation for `target`,
    /// returning how many were cancelled
    pub async fn cancel_all(&self, target: Channel) -> Result<usize> {
        let (reply, cancelled) = oneshot::channel();
        self.send(Command::CancelAll { target, reply })?;
        cancelled.await.map_err(|_| Error::SessionClosed)
    }

    /// Forgets everything about `peer`; any request for it afterwards
    /// fails with `Error::InvalidState`
    pub async fn remove_peer(&self, peer: &PeerId) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::RemovePeer { peer: peer.clone(), reply })?;
        done.await.map_err(|_| Error::SessionClosed)
    }

    /// Returns a stream of all engine events: peer state changes, value
    /// notifications and retry give-ups. Also see `peer_events` which may
    /// be convenient when you are only interested in a single peer.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    /// As a convenience this provides a filtered stream of events that
    /// guarantees any peer events will only relate to the specified peer.
    /// Events unrelated to any peer are delivered unfiltered.
    pub fn peer_events(&self, peer: &PeerId) -> Result<impl Stream<Item = Event>> {
        let filter = peer.clone();
        Ok(self.events()?.filter_map(move |event| {
            let keep = match event.peer() {
                Some(peer) => *peer == filter,
                None => true,
            };
            async move {
                if keep {
                    Some(event)
                } else {
                    None
                }
            }
        }))
    }

    /// Returns a handle for issuing operations against `id`
    ///
    /// This doesn't involve any IO; the peer is only tracked once the
    /// first operation for it is queued (or the transport reports it).
    pub fn peer(&self, id: PeerId) -> Peer {
        Peer::new(self.clone(), id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<PeerState> {
        self.shared.peers.get(peer).map(|snapshot| snapshot.state)
    }

    pub fn capabilities(&self, peer: &PeerId) -> Option<Vec<Capability>> {
        self.shared.peers.get(peer).map(|snapshot| snapshot.capabilities.clone())
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Starts scanning for peers
    ///
    /// Note: It's an error to try and start scanning while already
    /// scanning.
    pub async fn start_scanning(&self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Other(anyhow!("Already scanning")));
        }
        self.execute(Channel::Manager, OperationKind::StartScan, None).await?;
        Ok(())
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        if !self.is_scanning() {
            return Err(Error::Other(anyhow!("Not currently scanning")));
        }
        self.execute(Channel::Manager, OperationKind::StopScan, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeController, FakeTransport};
    use crate::operation::{FailureReason, RequestKind, ValueHandle};
    use crate::retry::RetryKind;
    use std::str::FromStr;

    async fn fake_session(config: SessionConfig) -> (Session, FakeController) {
        let _ = pretty_env_logger::try_init();
        let mut controller = None;
        let session = config.start(|bus| {
                                let (transport, fake) = FakeTransport::with_event_bus(bus);
                                controller = Some(fake);
                                Ok(transport)
                            })
                            .await
                            .unwrap();
        (session, controller.unwrap())
    }

    fn peer() -> PeerId {
        PeerId::from_str("00:11:22:33:44:55").unwrap()
    }

    #[tokio::test]
    async fn session_eq() {
        let (session0, _) = fake_session(SessionConfig::new()).await;
        let (session1, _) = fake_session(SessionConfig::new()).await;
        assert_ne!(session0, session1);
        assert_eq!(session0, session0.clone());
    }

    #[tokio::test(start_paused = true)]
    async fn scanning_round_trip() {
        let (session, _controller) = fake_session(SessionConfig::new()).await;
        session.start_scanning().await.unwrap();
        assert!(session.is_scanning());
        assert!(session.start_scanning().await.is_err());
        session.stop_scanning().await.unwrap();
        assert!(!session.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_reports_invalid_targets() {
        let (session, _controller) = fake_session(SessionConfig::new()).await;
        let err = session.execute(Channel::Manager, OperationKind::Connect, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        session.remove_peer(&peer()).await.unwrap();
        let err = session.execute(Channel::Peer(peer()), OperationKind::Connect, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_operation_times_out() {
        let mut config = SessionConfig::new();
        let mut manager_config = ManagerConfig::default();
        manager_config.operation_timeout = Duration::from_secs(2);
        config.set_config(manager_config);
        let (session, controller) = fake_session(config).await;
        session.execute(Channel::Peer(peer()), OperationKind::Connect, None).await.unwrap();
        controller.ignore_next(RequestKind::ReadRssi);

        let started = tokio::time::Instant::now();
        let err = session.execute(Channel::Peer(peer()), OperationKind::ReadRssi, None)
                         .await
                         .unwrap_err();
        assert!(matches!(err, Error::Operation(ref failure) if failure.reason == FailureReason::TimedOut));
        assert!(started.elapsed() >= Duration::from_secs(2));

        // The next RSSI read waits out the grace period for the lost answer
        let rssi = session.execute(Channel::Peer(peer()), OperationKind::ReadRssi, None).await.unwrap();
        assert_eq!(rssi, Payload::Rssi(-60));
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn link_bound_requests_need_a_connection() {
        let (session, controller) = fake_session(SessionConfig::new()).await;
        let err = session.execute(Channel::Peer(peer()), OperationKind::ReadRssi, None).await.unwrap_err();
        assert!(matches!(err, Error::Operation(ref failure) if failure.reason == FailureReason::NotConnected));
        assert!(controller.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn give_up_is_reported_as_an_event() {
        let (session, controller) = fake_session(SessionConfig::new()).await;
        let mut events = Box::pin(session.peer_events(&peer()).unwrap());
        for _ in 0..3 {
            controller.fail_next(RequestKind::Connect, crate::transport::TransportFailure::Status(8));
        }

        let err = session.execute(Channel::Peer(peer()), OperationKind::Connect, None).await.unwrap_err();
        assert!(matches!(err, Error::Operation(ref failure) if failure.retry_pending));

        loop {
            match events.next().await {
                Some(Event::PeerGaveUp { kind, attempts, .. }) => {
                    assert_eq!(kind, RetryKind::Connect);
                    assert_eq!(attempts, 3);
                    break;
                }
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
        assert_eq!(controller.count(RequestKind::Connect), 3);
        assert_eq!(session.peer_state(&peer()), Some(PeerState::DISCONNECTED));
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_reach_the_event_stream() {
        let (session, controller) = fake_session(SessionConfig::new()).await;
        let mut events = Box::pin(session.events().unwrap());
        controller.notify(&peer(), ValueHandle(3), vec![9]);

        match events.next().await {
            Some(Event::ValueChanged { peer: from, handle, value }) => {
                assert_eq!(from, peer());
                assert_eq!(handle, ValueHandle(3));
                assert_eq!(value, vec![9]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_the_session_stops_the_loop() {
        let (session, _controller) = fake_session(SessionConfig::new()).await;
        let mut events = session.event_bus.subscribe();
        drop(session);
        // The Manager holds the last sender, so the bus only closes once
        // the update loop has exited
        let closed = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(matches!(closed, Err(broadcast::error::RecvError::Closed)));
    }
}
