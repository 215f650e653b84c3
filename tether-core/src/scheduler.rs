//! Transmit scheduler: the periodic driver loop.
//!
//! Every tick either tears the node down (exchange complete), sends the next
//! packet (ready and not paused), or idles waiting for the peer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::node::{LinkStatus, Shared};
use crate::protocol::Packet;
use crate::wire::encode_packet;

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Tick {
    TornDown,
    Sent(Packet),
    SendFailed(Packet),
    Idle,
}

/// Re-add the peer on the radio's current channel.
fn refresh_peer(shared: &Shared) {
    if let Err(e) = shared.reregister() {
        warn!(peer = %shared.peer_mac, error = %e, "peer re-registration failed");
    }
}

/// One scheduler step. `retry` holds a packet whose send failed; it goes out
/// again before the engine is asked for anything new, and before teardown.
pub(crate) fn tick(shared: &Shared, retry: &mut Option<Packet>) -> Tick {
    let paused = shared.paused.load(Ordering::SeqCst);

    if shared.is_complete() && !paused && retry.is_none() {
        shared.teardown();
        return Tick::TornDown;
    }

    if !paused && shared.ready.load(Ordering::SeqCst) {
        shared.set_status(LinkStatus::Transmitting);
        let packet = match retry.take() {
            Some(p) => p,
            None => shared.engine().prepare_outgoing(),
        };
        info!(
            channel = shared.transport.current_channel(),
            topic = ?packet.topic,
            ack = %packet.ack,
            payload = %packet.payload,
            "transmitting"
        );

        refresh_peer(shared);
        // Cleared before the send: the reply can land before `send` returns.
        shared.ready.store(false, Ordering::SeqCst);
        match shared.transport.send(&shared.peer_mac, &encode_packet(&packet)) {
            Ok(()) => Tick::Sent(packet),
            Err(e) => {
                warn!(error = %e, "transmission failed, retrying next tick");
                refresh_peer(shared);
                shared.ready.store(true, Ordering::SeqCst);
                *retry = Some(packet.clone());
                Tick::SendFailed(packet)
            }
        }
    } else {
        shared.set_status(LinkStatus::Waiting);
        debug!(role = ?shared.role, paused, "waiting for the peer");
        Tick::Idle
    }
}

/// Drive [`tick`] every poll interval until stopped or torn down.
pub(crate) async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    info!(interval = ?shared.config.poll_interval, "transmit loop started");
    let mut retry = None;
    loop {
        if *stop.borrow() {
            break;
        }
        if tick(&shared, &mut retry) == Tick::TornDown {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
            _ = stop.changed() => break,
        }
    }
    info!("transmit loop stopped");
}
