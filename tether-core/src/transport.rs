//! Radio transport seam. The node drives it; the driver calls back through [`Inbound`].
//!
//! [`LoopbackTransport`] connects two nodes in memory, with optional packet loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng;
use tracing::trace;

use crate::peer::{MacAddress, PeerDescriptor};
use crate::receive::Inbound;

/// Default operating channel.
pub const DEFAULT_CHANNEL: u8 = 6;

/// Error reported by a transport primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,
    #[error("transport failed to start: {0}")]
    Init(String),
    #[error("peer {0} is not registered")]
    PeerNotFound(MacAddress),
    #[error("peer registered on channel {registered}, transport is on {current}")]
    ChannelMismatch { registered: u8, current: u8 },
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Connectionless datagram driver (the radio). Calls are non-blocking.
pub trait Transport: Send + Sync + 'static {
    /// Bring the radio up on `channel`; arriving frames go to `inbound`.
    fn begin(&self, channel: u8, inbound: Inbound) -> Result<(), TransportError>;
    /// Tear the radio down. Idempotent.
    fn end(&self);
    fn add_peer(&self, peer: &PeerDescriptor) -> Result<(), TransportError>;
    fn remove_peer(&self, mac: &MacAddress) -> Result<(), TransportError>;
    /// Channel the radio is on right now; may differ from the one passed to `begin`.
    fn current_channel(&self) -> u8;
    fn local_mac(&self) -> MacAddress;
    /// Queue one frame for `to`. Ok means accepted, not delivered.
    fn send(&self, to: &MacAddress, frame: &[u8]) -> Result<(), TransportError>;
}

#[derive(Default)]
struct Medium {
    attached: Mutex<HashMap<MacAddress, Inbound>>,
}

/// In-memory radio shared by the endpoints created with [`LoopbackTransport::pair`].
pub struct LoopbackTransport {
    mac: MacAddress,
    medium: Arc<Medium>,
    channel: AtomicU8,
    peers: Mutex<HashMap<MacAddress, u8>>,
    loss: f64,
    begun: AtomicBool,
    fail_begin: AtomicBool,
    fail_sends: AtomicUsize,
    begin_calls: AtomicUsize,
    end_calls: AtomicUsize,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackTransport {
    /// Two endpoints on the same medium.
    pub fn pair(a: MacAddress, b: MacAddress) -> (Self, Self) {
        let medium = Arc::new(Medium::default());
        (Self::attach(a, medium.clone()), Self::attach(b, medium))
    }

    fn attach(mac: MacAddress, medium: Arc<Medium>) -> Self {
        Self {
            mac,
            medium,
            channel: AtomicU8::new(DEFAULT_CHANNEL),
            peers: Mutex::new(HashMap::new()),
            loss: 0.0,
            begun: AtomicBool::new(false),
            fail_begin: AtomicBool::new(false),
            fail_sends: AtomicUsize::new(0),
            begin_calls: AtomicUsize::new(0),
            end_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Drop accepted frames with probability `rate` (clamped to 0..=1).
    pub fn with_loss(mut self, rate: f64) -> Self {
        self.loss = rate.clamp(0.0, 1.0);
        self
    }

    /// Move the radio to another channel without touching the peer table.
    pub fn set_channel(&self, channel: u8) {
        self.channel.store(channel, Ordering::SeqCst);
    }

    pub fn registered_channel(&self, mac: &MacAddress) -> Option<u8> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(mac)
            .copied()
    }

    /// Make the next `begin` fail.
    pub fn fail_begin(&self) {
        self.fail_begin.store(true, Ordering::SeqCst);
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }

    pub fn is_begun(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Every frame accepted by `send`, lost ones included.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for LoopbackTransport {
    fn begin(&self, channel: u8, inbound: Inbound) -> Result<(), TransportError> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_begin.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Init("injected failure".into()));
        }
        self.channel.store(channel, Ordering::SeqCst);
        self.medium
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.mac, inbound);
        self.begun.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end(&self) {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        self.begun.store(false, Ordering::SeqCst);
        self.medium
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.mac);
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
        if !self.is_begun() {
            return Err(TransportError::NotStarted);
        }
        let registered = self
            .registered_channel(to)
            .ok_or(TransportError::PeerNotFound(*to))?;
        let current = self.current_channel();
        if registered != current {
            return Err(TransportError::ChannelMismatch {
                registered,
                current,
            });
        }
        let injected = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::SendFailed("injected failure".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.to_vec());

        if self.loss > 0.0 && rand::thread_rng().gen_bool(self.loss) {
            trace!(to = %to, "loopback frame lost");
            return Ok(());
        }
        let target = self
            .medium
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(to)
            .cloned();
        if let Some(inbound) = target {
            inbound.deliver(self.mac, frame);
        }
        Ok(())
    }
}
