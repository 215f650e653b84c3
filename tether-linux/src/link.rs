//! Emulated radio over UDP.
//!
//! Each datagram carries the sender's 6-byte hardware address followed by one
//! encoded packet. The link keeps its own peer table and channel, so a channel
//! hop breaks sends the way a real radio does until the node re-registers the
//! peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tether_core::peer::PeerDescriptor;
use tether_core::{Inbound, MacAddress, Transport, TransportError, DEFAULT_CHANNEL, PACKET_LEN};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

const MAC_LEN: usize = 6;

/// Sender address plus one packet.
pub const DATAGRAM_LEN: usize = MAC_LEN + PACKET_LEN;

const RECV_BUFFER: usize = DATAGRAM_LEN * 4;

struct Running {
    socket: Arc<UdpSocket>,
    stop_tx: watch::Sender<bool>,
}

pub struct UdpLink {
    mac: MacAddress,
    bind: SocketAddr,
    peer_addr: SocketAddr,
    channel: AtomicU8,
    peers: Mutex<HashMap<MacAddress, u8>>,
    running: Mutex<Option<Running>>,
}

impl UdpLink {
    pub fn new(mac: MacAddress, bind: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            mac,
            bind,
            peer_addr,
            channel: AtomicU8::new(DEFAULT_CHANNEL),
            peers: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    /// Move to another channel without touching the peer table.
    #[cfg(test)]
    pub fn set_channel(&self, channel: u8) {
        info!(from = self.current_channel(), to = channel, "link channel changed");
        self.channel.store(channel, Ordering::SeqCst);
    }

    fn bind_socket(&self) -> std::io::Result<UdpSocket> {
        let std_sock = std::net::UdpSocket::bind(self.bind)?;
        std_sock.set_nonblocking(true)?;
        UdpSocket::from_std(std_sock)
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        inbound: Inbound,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, src)) => {
                        trace!(len = n, %src, "datagram received");
                        match split_datagram(&buf[..n]) {
                            Some((from, frame)) => inbound.deliver(from, frame),
                            None => debug!(len = n, %src, "datagram too short"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "recv error");
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }
        debug!("link read loop stopped");
    }
}

/// Sender address and packet bytes, or `None` if the datagram is too short to
/// carry an address.
pub fn split_datagram(datagram: &[u8]) -> Option<(MacAddress, &[u8])> {
    if datagram.len() < MAC_LEN {
        return None;
    }
    let (mac, frame) = datagram.split_at(MAC_LEN);
    let mut bytes = [0u8; MAC_LEN];
    bytes.copy_from_slice(mac);
    Some((MacAddress(bytes), frame))
}

pub fn join_datagram(from: &MacAddress, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAC_LEN + frame.len());
    out.extend_from_slice(from.as_bytes());
    out.extend_from_slice(frame);
    out
}

impl Transport for UdpLink {
    /// Must be called from within a tokio runtime.
    fn begin(&self, channel: u8, inbound: Inbound) -> Result<(), TransportError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TransportError::Init("no tokio runtime".into()));
        }
        let socket = Arc::new(
            self.bind_socket()
                .map_err(|e| TransportError::Init(format!("bind {}: {e}", self.bind)))?,
        );
        self.channel.store(channel, Ordering::SeqCst);

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(Self::read_loop(socket.clone(), inbound, stop_rx));
        info!(mac = %self.mac, bind = %self.bind, peer = %self.peer_addr, channel, "link up");
        *running = Some(Running { socket, stop_tx });
        Ok(())
    }

    fn end(&self) {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(r) = taken {
            r.stop_tx.send_replace(true);
            info!(mac = %self.mac, "link down");
        }
    }

    fn add_peer(&self, peer: &PeerDescriptor) -> Result<(), TransportError> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.mac, peer.channel);
        Ok(())
    }

    fn remove_peer(&self, mac: &MacAddress) -> Result<(), TransportError> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(mac)
            .map(|_| ())
            .ok_or(TransportError::PeerNotFound(*mac))
    }

    fn current_channel(&self) -> u8 {
        self.channel.load(Ordering::SeqCst)
    }

    fn local_mac(&self) -> MacAddress {
        self.mac
    }

    fn send(&self, to: &MacAddress, frame: &[u8]) -> Result<(), TransportError> {
        let socket = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.socket.clone())
            .ok_or(TransportError::NotStarted)?;
        let registered = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .copied()
            .ok_or(TransportError::PeerNotFound(*to))?;
        let current = self.current_channel();
        if registered != current {
            return Err(TransportError::ChannelMismatch {
                registered,
                current,
            });
        }
        let datagram = join_datagram(&self.mac, frame);
        socket
            .try_send_to(&datagram, self.peer_addr)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(len = datagram.len(), to = %self.peer_addr, "datagram sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::logging;
    use tether_core::{
        encode_packet, AckTopic, HandlerError, Node, NodeConfig, Packet, Payload, Topic,
    };

    const MASTER: MacAddress = MacAddress([0x24, 0xEC, 0x4A, 0x09, 0xC8, 0x00]);
    const SLAVE: MacAddress = MacAddress([0x48, 0xCA, 0x43, 0x09, 0x5E, 0x70]);

    fn free_addr() -> SocketAddr {
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap()
    }

    fn fast(peer: MacAddress) -> NodeConfig {
        NodeConfig {
            poll_interval: Duration::from_millis(10),
            association_settle: Duration::ZERO,
            ..NodeConfig::new(peer)
        }
    }

    #[test]
    fn datagram_layout() {
        let d = join_datagram(&MASTER, &[7u8; PACKET_LEN]);
        assert_eq!(d.len(), DATAGRAM_LEN);
        let (from, frame) = split_datagram(&d).unwrap();
        assert_eq!(from, MASTER);
        assert_eq!(frame, &[7u8; PACKET_LEN][..]);
        assert!(split_datagram(&[1, 2, 3]).is_none());
    }

    #[test]
    fn begin_outside_runtime_fails() {
        let link = UdpLink::new(MASTER, free_addr(), free_addr());
        assert!(matches!(
            link.begin(6, Inbound::detached()),
            Err(TransportError::Init(_))
        ));
    }

    #[tokio::test]
    async fn send_prefixes_mac_and_checks_channel() {
        logging::init_for_tests();
        let listener = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let link = UdpLink::new(MASTER, free_addr(), listener.local_addr().unwrap());

        assert_eq!(link.send(&SLAVE, b"x"), Err(TransportError::NotStarted));
        link.begin(6, Inbound::detached()).unwrap();
        assert_eq!(link.send(&SLAVE, b"x"), Err(TransportError::PeerNotFound(SLAVE)));

        link.add_peer(&PeerDescriptor { mac: SLAVE, channel: 6 }).unwrap();
        link.set_channel(1);
        assert!(matches!(
            link.send(&SLAVE, b"x"),
            Err(TransportError::ChannelMismatch { registered: 6, current: 1 })
        ));

        link.add_peer(&PeerDescriptor { mac: SLAVE, channel: 1 }).unwrap();
        link.send(&SLAVE, b"hello").unwrap();
        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..MAC_LEN], MASTER.as_bytes());
        assert_eq!(&buf[MAC_LEN..n], b"hello");

        link.end();
        link.end();
        assert_eq!(link.send(&SLAVE, b"x"), Err(TransportError::NotStarted));
    }

    #[tokio::test]
    async fn received_datagrams_reach_the_node() {
        logging::init_for_tests();
        let bind = free_addr();
        let link = Arc::new(UdpLink::new(SLAVE, bind, free_addr()));
        let node = Node::slave(fast(MASTER), link.clone());
        let accept = |_: &str| -> Result<(), HandlerError> { Ok(()) };
        node.register_ssid_handler(accept).unwrap();
        node.register_password_handler(accept).unwrap();
        node.add_credentials("10.0.0.7", "").unwrap();
        node.start().unwrap();

        let packet = Packet::new(
            Topic::WifiSsid,
            AckTopic::ReceivedHandshake,
            Payload::new("home-network").unwrap(),
        );
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(&join_datagram(&MASTER, &encode_packet(&packet)), bind)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while node.last_incoming() != packet {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("datagram not delivered");
        node.end().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_exchange_over_udp() {
        logging::init_for_tests();
        let (master_addr, slave_addr) = (free_addr(), free_addr());
        let master_link = Arc::new(UdpLink::new(MASTER, master_addr, slave_addr));
        let slave_link = Arc::new(UdpLink::new(SLAVE, slave_addr, master_addr));

        let store = Arc::new(crate::store::CredentialStore::new());
        let learned = Arc::new(crate::store::CredentialStore::new());

        let master = Node::master(
            fast(SLAVE),
            master_link,
            Arc::new(crate::station::CommandStation::new(None)),
        );
        master
            .register_camera_address_handler(learned.camera_address_handler())
            .unwrap();
        master.add_credentials("home-network", "hunter22").unwrap();

        let slave = Node::slave(fast(MASTER), slave_link);
        slave.register_ssid_handler(store.ssid_handler()).unwrap();
        slave.register_password_handler(store.password_handler()).unwrap();
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

        assert_eq!(
            store.network(),
            Some(("home-network".to_string(), "hunter22".to_string()))
        );
        assert_eq!(learned.camera_address().as_deref(), Some("10.0.0.7"));
    }
}
