//! Receive path.
//!
//! The transport hands raw frames to [`Inbound::deliver`] on whatever thread its
//! driver runs. Delivery only stores the decoded packet and wakes the processor;
//! handlers run later on the processor task, never inside the driver callback.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::callbacks::dispatch_slot;
use crate::integrity::{check_ack, AckCheck};
use crate::node::Shared;
use crate::peer::MacAddress;
use crate::wire::decode_packet;

/// Where a transport delivers frames. Cheap to clone.
#[derive(Clone, Default)]
pub struct Inbound {
    shared: Weak<Shared>,
}

impl Inbound {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    /// An inbound that drops everything; for driving a transport without a node.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Accept one frame from `from`. Frames from anyone but the peer, and frames
    /// that do not decode, are dropped. Never blocks on handler work.
    pub fn deliver(&self, from: MacAddress, bytes: &[u8]) {
        let Some(shared) = self.shared.upgrade() else {
            trace!(from = %from, "no node attached, frame dropped");
            return;
        };
        if from != shared.peer_mac {
            debug!(from = %from, "ignoring frame from unknown sender");
            return;
        }
        match decode_packet(bytes) {
            Ok(packet) => {
                info!(
                    topic = ?packet.topic,
                    ack = %packet.ack,
                    payload = %packet.payload,
                    "received"
                );
                shared.engine().record_incoming(packet);
                shared.arrival.notify_one();
            }
            Err(e) => {
                warn!(from = %from, len = bytes.len(), error = %e, "dropping malformed frame")
            }
        }
    }
}

/// Handle the most recent incoming packet. Returns whether the handler succeeded
/// and the node may transmit again.
pub(crate) async fn process(shared: &Shared) -> bool {
    let (outgoing, incoming) = {
        let engine = shared.engine();
        (engine.outgoing().clone(), engine.incoming().clone())
    };

    if let AckCheck::Mismatch { sent, confirmed } = check_ack(&outgoing, &incoming) {
        debug!(?sent, ?confirmed, "ack does not confirm the last topic sent");
    }

    let slot = dispatch_slot(shared.role, &incoming);
    let Some(handler) = shared.handler(slot) else {
        warn!(%slot, "no handler registered, packet ignored");
        return false;
    };

    let payload = incoming.payload.as_str().to_owned();
    match tokio::task::spawn_blocking(move || handler.handle(&payload)).await {
        Ok(Ok(())) => {
            debug!(%slot, "handler accepted packet");
            shared.ready.store(true, Ordering::SeqCst);
            true
        }
        Ok(Err(e)) => {
            warn!(%slot, error = %e, "handler failed");
            false
        }
        Err(e) => {
            warn!(%slot, error = %e, "handler panicked");
            false
        }
    }
}

/// Wait for arrivals and process them one at a time until stopped or complete.
pub(crate) async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    info!("receive loop started");
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = shared.arrival.notified() => {}
            _ = stop.changed() => break,
        }
        if shared.is_complete() {
            shared.teardown();
            break;
        }
        process(&shared).await;
    }
    info!("receive loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::callbacks::HandlerError;
    use crate::node::{Node, NodeConfig};
    use crate::protocol::{AckTopic, Packet, Payload, Topic};
    use crate::transport::LoopbackTransport;
    use crate::wire::encode_packet;

    const MASTER: MacAddress = MacAddress([0x24, 0xEC, 0x4A, 0x09, 0xC8, 0x00]);
    const SLAVE: MacAddress = MacAddress([0x48, 0xCA, 0x43, 0x09, 0x5E, 0x70]);

    fn slave() -> (Node, Inbound, Arc<Mutex<Vec<String>>>) {
        let (_a, b) = LoopbackTransport::pair(MASTER, SLAVE);
        let node = Node::slave(NodeConfig::new(MASTER), Arc::new(b));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        node.register_ssid_handler(move |p: &str| -> Result<(), HandlerError> {
            log.lock().unwrap().push(p.to_string());
            Ok(())
        })
        .unwrap();
        node.register_password_handler(|_: &str| -> Result<(), HandlerError> {
            Err(HandlerError::rejected("not today"))
        })
        .unwrap();
        let inbound = Inbound::new(node.shared_arc());
        (node, inbound, seen)
    }

    fn frame(topic: Topic, ack: AckTopic, payload: &str) -> Vec<u8> {
        encode_packet(&Packet::new(topic, ack, Payload::new(payload).unwrap())).to_vec()
    }

    #[test]
    fn deliver_stores_frames_from_peer_only() {
        let (node, inbound, _) = slave();
        inbound.deliver(
            MacAddress([9; 6]),
            &frame(Topic::WifiSsid, AckTopic::ReceivedHandshake, "intruder"),
        );
        assert_eq!(node.last_incoming().topic, Topic::Handshake);

        inbound.deliver(MASTER, &frame(Topic::WifiSsid, AckTopic::ReceivedHandshake, "home"));
        let got = node.last_incoming();
        assert_eq!(got.topic, Topic::WifiSsid);
        assert_eq!(got.payload.as_str(), "home");
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let (node, inbound, _) = slave();
        inbound.deliver(MASTER, &[0u8; 10]);
        let mut bad = frame(Topic::WifiSsid, AckTopic::ReceivedHandshake, "home");
        bad[0] = 0;
        inbound.deliver(MASTER, &bad);
        assert_eq!(node.last_incoming().topic, Topic::Handshake);
    }

    #[test]
    fn detached_inbound_drops_everything() {
        Inbound::detached().deliver(MASTER, &[0u8; 66]);
    }

    #[tokio::test]
    async fn successful_handler_sets_ready() {
        let (node, inbound, seen) = slave();
        assert!(!node.is_ready_to_transmit());
        inbound.deliver(MASTER, &frame(Topic::WifiSsid, AckTopic::ReceivedHandshake, "home"));

        assert!(process(node.shared()).await);
        assert!(node.is_ready_to_transmit());
        assert_eq!(seen.lock().unwrap().as_slice(), &["home".to_string()]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_advance() {
        let (node, inbound, _) = slave();
        inbound.deliver(
            MASTER,
            &frame(Topic::WifiPassword, AckTopic::ReceivedWifiSsid, "hunter22"),
        );
        assert!(!process(node.shared()).await);
        assert!(!node.is_ready_to_transmit());
    }

    #[tokio::test]
    async fn builtin_ack_handler_covers_other_topics() {
        let (node, inbound, _) = slave();
        inbound.deliver(
            MASTER,
            &frame(
                Topic::CameraAddress,
                AckTopic::ReceivedWifiPassword,
                "Received Camera IP Request",
            ),
        );
        assert!(process(node.shared()).await);
    }

    #[tokio::test]
    async fn arrivals_before_processing_collapse_into_one() {
        let (node, inbound, seen) = slave();
        inbound.deliver(MASTER, &frame(Topic::WifiSsid, AckTopic::ReceivedHandshake, "one"));
        inbound.deliver(MASTER, &frame(Topic::WifiSsid, AckTopic::ReceivedHandshake, "two"));

        let shared = node.shared_arc().clone();
        let task = tokio::spawn(run(shared.clone(), shared.shutdown.subscribe()));
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !node.is_ready_to_transmit() {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("arrival not processed");
        // Give a second wake, if one were stored, the chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        shared.shutdown.signal_stop();
        task.await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &["two".to_string()]);
    }
}
