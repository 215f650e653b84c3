//! Tether wire protocol: topics, acks, roles, bounded payloads and the packet itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Payload field size on the wire, terminator included.
pub const PAYLOAD_FIELD_LEN: usize = 64;

/// Longest payload that fits the field next to its NUL terminator.
pub const MAX_PAYLOAD_LEN: usize = PAYLOAD_FIELD_LEN - 1;

/// Subject of a transmitted packet. Discriminants are the wire ordinals; 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Topic {
    Handshake = 1,
    WifiSsid = 2,
    WifiPassword = 3,
    CameraAddress = 4,
    /// Disconnect: the exchange is over.
    Wave = 5,
    /// Reserved, never produced by the engine.
    Ping = 6,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Handshake,
        Topic::WifiSsid,
        Topic::WifiPassword,
        Topic::CameraAddress,
        Topic::Wave,
        Topic::Ping,
    ];

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.to_byte() == b)
    }
}

/// Acknowledgment code: which topic the sender last received. Travels as an ASCII letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckTopic {
    ReceivedHandshake,
    ReceivedWifiSsid,
    ReceivedWifiPassword,
    ReceivedCameraAddress,
    ReceivedWave,
    ReceivedPing,
}

impl AckTopic {
    pub const ALL: [AckTopic; 6] = [
        AckTopic::ReceivedHandshake,
        AckTopic::ReceivedWifiSsid,
        AckTopic::ReceivedWifiPassword,
        AckTopic::ReceivedCameraAddress,
        AckTopic::ReceivedWave,
        AckTopic::ReceivedPing,
    ];

    pub fn to_byte(self) -> u8 {
        match self {
            AckTopic::ReceivedHandshake => b'H',
            AckTopic::ReceivedWifiSsid => b'S',
            AckTopic::ReceivedWifiPassword => b'P',
            AckTopic::ReceivedCameraAddress => b'C',
            AckTopic::ReceivedWave => b'W',
            AckTopic::ReceivedPing => b'G',
        }
    }

    pub fn from_byte(b: u8) -> Option<AckTopic> {
        AckTopic::ALL.into_iter().find(|a| a.to_byte() == b)
    }

    /// The topic this ack confirms.
    pub fn topic(self) -> Topic {
        match self {
            AckTopic::ReceivedHandshake => Topic::Handshake,
            AckTopic::ReceivedWifiSsid => Topic::WifiSsid,
            AckTopic::ReceivedWifiPassword => Topic::WifiPassword,
            AckTopic::ReceivedCameraAddress => Topic::CameraAddress,
            AckTopic::ReceivedWave => Topic::Wave,
            AckTopic::ReceivedPing => Topic::Ping,
        }
    }
}

impl fmt::Display for AckTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_byte() as char)
    }
}

/// Node role, fixed for the lifetime of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Orchestrates the sequence and initiates each topic.
    Master,
    /// Answers with data matching the received topic.
    Slave,
}

/// Error building a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is {len} bytes, limit is {MAX_PAYLOAD_LEN}")]
    TooLong { len: usize },
    #[error("payload contains a NUL byte")]
    InteriorNul,
}

/// Bounded payload string: at most [`MAX_PAYLOAD_LEN`] bytes, no NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Payload(String);

impl Payload {
    /// Build a payload, failing if it would not fit the wire field.
    pub fn new(s: impl Into<String>) -> Result<Self, PayloadError> {
        let s = s.into();
        if s.len() > MAX_PAYLOAD_LEN {
            return Err(PayloadError::TooLong { len: s.len() });
        }
        if s.contains('\0') {
            return Err(PayloadError::InteriorNul);
        }
        Ok(Payload(s))
    }

    /// Build a payload, cutting at the first NUL and at the last char boundary that fits.
    pub fn truncated(s: &str) -> Self {
        let s = s.split('\0').next().unwrap_or("");
        let mut end = s.len().min(MAX_PAYLOAD_LEN);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        Payload(s[..end].to_string())
    }

    pub fn empty() -> Self {
        Payload(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One datagram's worth of protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub topic: Topic,
    pub ack: AckTopic,
    pub payload: Payload,
}

impl Packet {
    pub fn new(topic: Topic, ack: AckTopic, payload: Payload) -> Self {
        Self {
            topic,
            ack,
            payload,
        }
    }

    /// Placeholder both exchange slots start from.
    pub(crate) fn placeholder(text: &str) -> Self {
        Self::new(
            Topic::Handshake,
            AckTopic::ReceivedHandshake,
            Payload::truncated(text),
        )
    }
}

/// The two values a node hands to its peer.
///
/// Master: network name, network password. Slave: its reachable address, secondary value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub first: Payload,
    pub second: Payload,
}

impl CredentialBundle {
    pub fn new(first: &str, second: &str) -> Result<Self, PayloadError> {
        Ok(Self {
            first: Payload::new(first)?,
            second: Payload::new(second)?,
        })
    }

    /// Both fields equal usually means a misconfigured node.
    pub fn is_distinct(&self) -> bool {
        self.first != self.second
    }
}

impl Default for CredentialBundle {
    fn default() -> Self {
        Self {
            first: Payload::truncated("Empty"),
            second: Payload::truncated("Empty"),
        }
    }
}
