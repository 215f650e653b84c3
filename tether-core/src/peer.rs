//! The single known peer: hardware address, channel, and re-registration with the transport.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::{Transport, TransportError};

/// 6-byte hardware address. Displays as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Error parsing a hardware address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hardware address {0:?}, expected six hex octets separated by ':'")]
pub struct MacParseError(String);

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c: char| c == ':' || c == '-');
        for slot in out.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

/// Peer address plus the channel it was last registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub mac: MacAddress,
    pub channel: u8,
}

/// Tracks the one peer this node talks to.
#[derive(Debug)]
pub struct PeerRegistry {
    peer: PeerDescriptor,
}

impl PeerRegistry {
    pub fn new(mac: MacAddress, channel: u8) -> Self {
        Self {
            peer: PeerDescriptor { mac, channel },
        }
    }

    pub fn peer(&self) -> PeerDescriptor {
        self.peer
    }

    /// Initial registration, done once the transport is up.
    pub fn register<T: Transport + ?Sized>(&mut self, transport: &T) -> Result<(), TransportError> {
        transport.add_peer(&self.peer)
    }

    /// Remove the peer, pick up the transport's current channel, add it back.
    ///
    /// The transport may hop channels on its own; a peer registered on the old
    /// channel makes sends fail until it is re-added.
    pub fn reregister<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> Result<(), TransportError> {
        let removed = transport.remove_peer(&self.peer.mac);
        debug!(peer = %self.peer.mac, ok = removed.is_ok(), "peer removed");

        self.peer.channel = transport.current_channel();

        let added = transport.add_peer(&self.peer);
        debug!(
            peer = %self.peer.mac,
            channel = self.peer.channel,
            ok = added.is_ok(),
            "peer added"
        );
        added
    }

    /// Drop the peer from the transport at teardown.
    pub fn release<T: Transport + ?Sized>(&mut self, transport: &T) {
        if let Err(e) = transport.remove_peer(&self.peer.mac) {
            debug!(peer = %self.peer.mac, error = %e, "peer release failed");
        }
    }
}
