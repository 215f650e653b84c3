//! Node lifecycle: construction, handler registration, start, pause, teardown.
//!
//! A started node runs two tokio tasks over shared state: the transmit
//! scheduler and the receive processor. The transport's driver reaches the
//! node only through [`Inbound`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::callbacks::{CallbackRegistry, Handler, RegisterError, Slot, Station, StationHandler};
use crate::engine::ProtocolEngine;
use crate::peer::{MacAddress, PeerRegistry};
use crate::protocol::{CredentialBundle, Packet, PayloadError, Role};
use crate::receive::{self, Inbound};
use crate::scheduler;
use crate::shutdown::ShutdownToken;
use crate::transport::{Transport, TransportError, DEFAULT_CHANNEL};

/// Delay before the process restarts after a fatal transport failure.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pause around the master's own station association.
pub const DEFAULT_ASSOCIATION_SETTLE: Duration = Duration::from_secs(10);

/// Per-node settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// The one peer this node exchanges with.
    pub peer: MacAddress,
    pub channel: u8,
    /// Transmit scheduler period.
    pub poll_interval: Duration,
    pub association_settle: Duration,
}

impl NodeConfig {
    pub fn new(peer: MacAddress) -> Self {
        Self {
            peer,
            channel: DEFAULT_CHANNEL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            association_settle: DEFAULT_ASSOCIATION_SETTLE,
        }
    }
}

/// Coarse link state, observable through [`Node::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Built but not started.
    Idle,
    /// Started, waiting for the peer.
    Waiting,
    Transmitting,
    /// Torn down.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("node already started")]
    AlreadyStarted,
    #[error("no {0} handler registered")]
    MissingHandler(Slot),
    #[error("both credential values are identical")]
    IdenticalCredentials,
    #[error("transport initialization failed: {0}")]
    TransportInit(#[source] TransportError),
}

/// State shared by the node handle, both tasks and the inbound path.
pub(crate) struct Shared {
    pub(crate) role: Role,
    pub(crate) config: NodeConfig,
    pub(crate) peer_mac: MacAddress,
    pub(crate) transport: Arc<dyn Transport>,
    engine: Arc<Mutex<ProtocolEngine>>,
    peer: Mutex<PeerRegistry>,
    handlers: RwLock<CallbackRegistry>,
    pub(crate) ready: AtomicBool,
    pub(crate) paused: AtomicBool,
    /// Single-permit wake: several arrivals before the processor runs collapse into one.
    pub(crate) arrival: Notify,
    pub(crate) shutdown: ShutdownToken,
    status: watch::Sender<LinkStatus>,
    torn_down: AtomicBool,
}

impl Shared {
    /// Never hold the guard across an await.
    pub(crate) fn engine(&self) -> MutexGuard<'_, ProtocolEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.engine().is_exchange_complete()
    }

    pub(crate) fn handler(&self, slot: Slot) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slot)
    }

    pub(crate) fn set_status(&self, status: LinkStatus) {
        self.status.send_if_modified(|current| {
            if *current == status || *current == LinkStatus::Closed {
                return false;
            }
            *current = status;
            true
        });
    }

    pub(crate) fn reregister(&self) -> Result<(), TransportError> {
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reregister(self.transport.as_ref())
    }

    /// Stop both loops, drop the peer and shut the transport. Runs at most once.
    pub(crate) fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.signal_stop();
        self.peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(self.transport.as_ref());
        self.transport.end();
        self.status.send_replace(LinkStatus::Closed);
        info!(role = ?self.role, "node torn down");
    }
}

/// One end of the pairing exchange.
pub struct Node {
    shared: Arc<Shared>,
    started: AtomicBool,
    session: Mutex<Option<Uuid>>,
}

impl Node {
    /// A master node. `station` joins the network once the slave holds the password.
    pub fn master(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        station: Arc<dyn Station>,
    ) -> Self {
        let node = Self::build(Role::Master, config, transport);
        let password = StationHandler::new(
            node.shared.engine.clone(),
            station,
            node.shared.config.association_settle,
        );
        node.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .install(Slot::Password, Arc::new(password));
        node
    }

    pub fn slave(config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        Self::build(Role::Slave, config, transport)
    }

    fn build(role: Role, config: NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let (status, _) = watch::channel(LinkStatus::Idle);
        let shared = Shared {
            role,
            peer_mac: config.peer,
            peer: Mutex::new(PeerRegistry::new(config.peer, config.channel)),
            config,
            transport,
            engine: Arc::new(Mutex::new(ProtocolEngine::new(role))),
            handlers: RwLock::new(CallbackRegistry::new(role)),
            // The master opens the exchange; the slave waits to be spoken to.
            ready: AtomicBool::new(role == Role::Master),
            paused: AtomicBool::new(false),
            arrival: Notify::new(),
            shutdown: ShutdownToken::new(),
            status,
            torn_down: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
            started: AtomicBool::new(false),
            session: Mutex::new(None),
        }
    }

    fn register(&self, slot: Slot, handler: Arc<dyn Handler>) -> Result<(), RegisterError> {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(slot, handler)
    }

    /// Slave only.
    pub fn register_ssid_handler(&self, handler: impl Handler) -> Result<(), RegisterError> {
        self.register(Slot::Ssid, Arc::new(handler))
    }

    /// Slave only. On a master this slot holds the built-in station handler.
    pub fn register_password_handler(&self, handler: impl Handler) -> Result<(), RegisterError> {
        self.register(Slot::Password, Arc::new(handler))
    }

    /// Master only.
    pub fn register_camera_address_handler(
        &self,
        handler: impl Handler,
    ) -> Result<(), RegisterError> {
        self.register(Slot::CameraAddress, Arc::new(handler))
    }

    /// Replaces the built-in generic ack handler.
    pub fn register_ack_handler(&self, handler: impl Handler) -> Result<(), RegisterError> {
        self.register(Slot::Ack, Arc::new(handler))
    }

    /// Replaces the built-in handshake handler.
    pub fn register_handshake_handler(&self, handler: impl Handler) -> Result<(), RegisterError> {
        self.register(Slot::Handshake, Arc::new(handler))
    }

    /// Set the two values this node hands to its peer. Allowed at any time.
    pub fn add_credentials(&self, first: &str, second: &str) -> Result<(), PayloadError> {
        let bundle = CredentialBundle::new(first, second)?;
        self.shared.engine().set_credentials(bundle);
        info!(first, "credentials updated");
        Ok(())
    }

    /// Validate, bring the transport up and spawn both loops.
    ///
    /// Must be called from within a tokio runtime. Nothing touches the transport
    /// unless every required handler is present and the credentials are distinct.
    pub fn start(&self) -> Result<(), StartError> {
        let shared = &self.shared;
        if self.started.load(Ordering::SeqCst) || shared.torn_down.load(Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }
        let missing = shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .missing();
        if let Some(slot) = missing {
            warn!(role = ?shared.role, %slot, "cannot start without handler");
            return Err(StartError::MissingHandler(slot));
        }
        if !shared.engine().credentials().is_distinct() {
            warn!(role = ?shared.role, "cannot start with identical credential values");
            return Err(StartError::IdenticalCredentials);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StartError::AlreadyStarted);
        }

        if let Err(e) = self.bring_up() {
            error!(error = %e, "transport initialization failed");
            self.started.store(false, Ordering::SeqCst);
            return Err(StartError::TransportInit(e));
        }

        let session = Uuid::new_v4();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        info!(
            %session,
            role = ?shared.role,
            peer = %shared.peer_mac,
            channel = shared.config.channel,
            "node started"
        );
        shared.set_status(LinkStatus::Waiting);

        let transmit = tokio::spawn(
            scheduler::run(shared.clone(), shared.shutdown.subscribe())
                .instrument(info_span!("transmit", %session, role = ?shared.role)),
        );
        let receive = tokio::spawn(
            receive::run(shared.clone(), shared.shutdown.subscribe())
                .instrument(info_span!("receive", %session, role = ?shared.role)),
        );
        shared.shutdown.add_task(transmit);
        shared.shutdown.add_task(receive);
        Ok(())
    }

    fn bring_up(&self) -> Result<(), TransportError> {
        let shared = &self.shared;
        shared
            .transport
            .begin(shared.config.channel, Inbound::new(shared))?;
        let registered = shared
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(shared.transport.as_ref());
        if registered.is_err() {
            shared.transport.end();
        }
        registered
    }

    /// Tear down and wait for both loops to exit. Safe to call more than once.
    pub async fn end(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        self.shared.teardown();
        self.shared.shutdown.join_all().await;
    }

    /// Stop transmitting. Incoming packets are still stored and handled.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        info!(role = ?self.shared.role, "transmission paused");
    }

    pub fn unpause(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        info!(role = ?self.shared.role, "transmission resumed");
    }

    /// Re-add the peer on the transport's current channel.
    pub fn reregister(&self) -> Result<(), TransportError> {
        self.shared.reregister()
    }

    /// Resolves once the node has been torn down. Never resolves for a node
    /// that is not started.
    pub async fn closed(&self) {
        self.shared.shutdown.stopped().await;
    }

    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_exchange_complete(&self) -> bool {
        self.shared.is_complete()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_ready_to_transmit(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_master(&self) -> bool {
        self.shared.role == Role::Master
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Set by a successful [`Node::start`].
    pub fn session_id(&self) -> Option<Uuid> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_incoming(&self) -> Packet {
        self.shared.engine().incoming().clone()
    }

    pub fn last_outgoing(&self) -> Packet {
        self.shared.engine().outgoing().clone()
    }

    pub fn credentials(&self) -> CredentialBundle {
        self.shared.engine().credentials().clone()
    }

    pub fn peer_mac(&self) -> MacAddress {
        self.shared.peer_mac
    }

    pub fn local_mac(&self) -> MacAddress {
        self.shared.transport.local_mac()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn shared_arc(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            self.shared.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::callbacks::{HandlerError, StationError};
    use crate::protocol::{AckTopic, Payload, Topic};
    use crate::transport::LoopbackTransport;
    use crate::wire::{decode_packet, encode_packet};

    const MASTER: MacAddress = MacAddress([0x24, 0xEC, 0x4A, 0x09, 0xC8, 0x00]);
    const SLAVE: MacAddress = MacAddress([0x48, 0xCA, 0x43, 0x09, 0x5E, 0x70]);

    fn fast(peer: MacAddress) -> NodeConfig {
        NodeConfig {
            poll_interval: Duration::from_millis(5),
            association_settle: Duration::ZERO,
            ..NodeConfig::new(peer)
        }
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    fn recorder(seen: &Seen) -> impl Handler {
        let seen = seen.clone();
        move |p: &str| -> Result<(), HandlerError> {
            seen.lock().unwrap().push(p.to_string());
            Ok(())
        }
    }

    fn joined(seen: &Seen) -> impl Station {
        let seen = seen.clone();
        move |ssid: &str, password: &str| -> Result<(), StationError> {
            seen.lock().unwrap().push(format!("{ssid}/{password}"));
            Ok(())
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn master_without_camera_handler_refuses_to_start() {
        let (a, _b) = LoopbackTransport::pair(MASTER, SLAVE);
        let radio = Arc::new(a);
        let station: Seen = Default::default();
        let node = Node::master(fast(SLAVE), radio.clone(), Arc::new(joined(&station)));
        node.add_credentials("home-network", "hunter22").unwrap();

        assert!(matches!(
            node.start(),
            Err(StartError::MissingHandler(Slot::CameraAddress))
        ));
        assert_eq!(radio.begin_calls(), 0);
        assert!(!node.is_started());
        assert_eq!(*node.status().borrow(), LinkStatus::Idle);
    }

    #[tokio::test]
    async fn identical_credentials_refuse_to_start() {
        let (_a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let radio = Arc::new(b);
        let seen: Seen = Default::default();
        let node = Node::slave(fast(MASTER), radio.clone());
        node.register_ssid_handler(recorder(&seen)).unwrap();
        node.register_password_handler(recorder(&seen)).unwrap();

        // Defaults are "Empty"/"Empty".
        assert!(matches!(node.start(), Err(StartError::IdenticalCredentials)));
        node.add_credentials("same", "same").unwrap();
        assert!(matches!(node.start(), Err(StartError::IdenticalCredentials)));
        assert_eq!(radio.begin_calls(), 0);
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let (_a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let radio = Arc::new(b);
        radio.fail_begin();
        let seen: Seen = Default::default();
        let node = Node::slave(fast(MASTER), radio.clone());
        node.register_ssid_handler(recorder(&seen)).unwrap();
        node.register_password_handler(recorder(&seen)).unwrap();
        node.add_credentials("10.0.0.7", "").unwrap();

        assert!(matches!(node.start(), Err(StartError::TransportInit(_))));
        assert!(!node.is_started());
        assert!(node.session_id().is_none());
    }

    #[test]
    fn wrong_role_registration_is_refused() {
        let (_a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let node = Node::slave(fast(MASTER), Arc::new(b));
        let seen: Seen = Default::default();
        assert!(node.register_camera_address_handler(recorder(&seen)).is_err());
        assert!(node.register_ack_handler(recorder(&seen)).is_ok());
    }

    #[tokio::test]
    async fn paused_master_stores_incoming_but_stays_silent() {
        let (a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let radio = Arc::new(a);
        let station: Seen = Default::default();
        let node = Node::master(fast(SLAVE), radio.clone(), Arc::new(joined(&station)));
        node.register_camera_address_handler(recorder(&station)).unwrap();
        node.add_credentials("home-network", "hunter22").unwrap();
        node.pause();
        node.start().unwrap();

        // A bare endpoint plays the slave.
        b.begin(6, Inbound::detached()).unwrap();
        b.add_peer(&crate::peer::PeerDescriptor {
            mac: MASTER,
            channel: 6,
        })
        .unwrap();
        let reply = Packet::new(
            Topic::Handshake,
            AckTopic::ReceivedHandshake,
            Payload::new("Received Handshake Request").unwrap(),
        );
        b.send(&MASTER, &encode_packet(&reply)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(radio.sent_frames().is_empty());
        assert_eq!(node.last_incoming(), reply);
        assert_eq!(*node.status().borrow(), LinkStatus::Waiting);

        node.unpause();
        wait_until(|| !radio.sent_frames().is_empty()).await;
        let first = decode_packet(&radio.sent_frames()[0]).unwrap();
        assert_eq!(first.topic, Topic::Handshake);

        node.end().await;
    }

    #[tokio::test]
    async fn end_is_idempotent_and_closes() {
        let (_a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let radio = Arc::new(b);
        let seen: Seen = Default::default();
        let node = Node::slave(fast(MASTER), radio.clone());
        node.register_ssid_handler(recorder(&seen)).unwrap();
        node.register_password_handler(recorder(&seen)).unwrap();
        node.add_credentials("10.0.0.7", "").unwrap();
        node.start().unwrap();
        assert!(node.session_id().is_some());
        assert!(matches!(node.start(), Err(StartError::AlreadyStarted)));

        node.end().await;
        node.end().await;
        node.closed().await;
        assert_eq!(radio.end_calls(), 1);
        assert!(!radio.is_begun());
        assert_eq!(*node.status().borrow(), LinkStatus::Closed);
        assert!(matches!(node.start(), Err(StartError::AlreadyStarted)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_exchange_over_loopback() {
        let (a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let (master_radio, slave_radio) = (Arc::new(a), Arc::new(b));

        let joins: Seen = Default::default();
        let camera: Seen = Default::default();
        let master = Node::master(fast(SLAVE), master_radio.clone(), Arc::new(joined(&joins)));
        master.register_camera_address_handler(recorder(&camera)).unwrap();
        master.add_credentials("home-network", "hunter22").unwrap();

        let ssid: Seen = Default::default();
        let password: Seen = Default::default();
        let slave = Node::slave(fast(MASTER), slave_radio.clone());
        slave.register_ssid_handler(recorder(&ssid)).unwrap();
        slave.register_password_handler(recorder(&password)).unwrap();
        slave.add_credentials("10.0.0.7", "").unwrap();

        slave.start().unwrap();
        master.start().unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            master.closed().await;
            slave.closed().await;
        })
        .await
        .expect("exchange did not finish");
        master.end().await;
        slave.end().await;

        assert!(master.is_exchange_complete());
        assert!(slave.is_exchange_complete());
        assert_eq!(ssid.lock().unwrap().as_slice(), &["home-network".to_string()]);
        assert_eq!(password.lock().unwrap().as_slice(), &["hunter22".to_string()]);
        assert_eq!(camera.lock().unwrap().as_slice(), &["10.0.0.7".to_string()]);
        assert_eq!(
            joins.lock().unwrap().as_slice(),
            &["home-network/hunter22".to_string()]
        );
        assert_eq!(master.last_outgoing().topic, Topic::Wave);
        assert_eq!(master_radio.end_calls(), 1);
        assert_eq!(slave_radio.end_calls(), 1);
    }
}
