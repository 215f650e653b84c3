//! Protocol engine: given role and the last exchanged packets, decide what to send next.
//!
//! The pure tables are free functions so they can be checked in isolation;
//! [`ProtocolEngine`] owns the exchange state and applies them.

use tracing::{error, info};

use crate::protocol::{AckTopic, CredentialBundle, Packet, Payload, Role, Topic};

/// Master request literal sent after the camera address arrives, and on the terminal wave ack.
pub const WAVE_REQUEST: &str = "Received Wave Request";
/// Master request literal asking the slave for its address.
pub const CAMERA_ADDRESS_REQUEST: &str = "Received Camera IP Request";

/// Slave acknowledgment phrases.
pub const HANDSHAKE_REPLY: &str = "Received Handshake Request";
pub const SSID_REPLY: &str = "Received WiFi SSID Request";
pub const PASSWORD_REPLY: &str = "Received WiFi password Request";
pub const WAVE_REPLY: &str = "Received Wave Request";

/// The engine met a value outside its transition tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnreachableState {
    #[error("no transition from topic {0:?}")]
    Topic(Topic),
    #[error("no payload for ack {0:?}")]
    Ack(AckTopic),
}

/// Master topic cycle: Handshake, WifiSsid, WifiPassword, CameraAddress, Wave, back to Handshake.
pub fn next_topic(last_outgoing: Topic) -> Result<Topic, UnreachableState> {
    match last_outgoing {
        Topic::Handshake => Ok(Topic::WifiSsid),
        Topic::WifiSsid => Ok(Topic::WifiPassword),
        Topic::WifiPassword => Ok(Topic::CameraAddress),
        Topic::CameraAddress => Ok(Topic::Wave),
        Topic::Wave => Ok(Topic::Handshake),
        Topic::Ping => Err(UnreachableState::Topic(Topic::Ping)),
    }
}

/// Ack mirroring a received topic.
pub fn ack_for(topic: Topic) -> AckTopic {
    match topic {
        Topic::Handshake => AckTopic::ReceivedHandshake,
        Topic::WifiSsid => AckTopic::ReceivedWifiSsid,
        Topic::WifiPassword => AckTopic::ReceivedWifiPassword,
        Topic::CameraAddress => AckTopic::ReceivedCameraAddress,
        Topic::Wave => AckTopic::ReceivedWave,
        Topic::Ping => AckTopic::ReceivedPing,
    }
}

/// Master payload, keyed by the last ack the slave sent.
pub fn master_payload(
    last_incoming_ack: AckTopic,
    credentials: &CredentialBundle,
) -> Result<Payload, UnreachableState> {
    match last_incoming_ack {
        AckTopic::ReceivedCameraAddress => Ok(Payload::truncated(WAVE_REQUEST)),
        AckTopic::ReceivedHandshake => Ok(credentials.first.clone()),
        AckTopic::ReceivedWave => Ok(Payload::truncated(WAVE_REQUEST)),
        AckTopic::ReceivedWifiPassword => Ok(Payload::truncated(CAMERA_ADDRESS_REQUEST)),
        AckTopic::ReceivedWifiSsid => Ok(credentials.second.clone()),
        AckTopic::ReceivedPing => Err(UnreachableState::Ack(AckTopic::ReceivedPing)),
    }
}

/// Slave payload, keyed by the last topic the master sent.
pub fn slave_payload(
    last_incoming_topic: Topic,
    credentials: &CredentialBundle,
) -> Result<Payload, UnreachableState> {
    match last_incoming_topic {
        Topic::Handshake => Ok(Payload::truncated(HANDSHAKE_REPLY)),
        Topic::WifiSsid => Ok(Payload::truncated(SSID_REPLY)),
        Topic::WifiPassword => Ok(Payload::truncated(PASSWORD_REPLY)),
        Topic::CameraAddress => Ok(credentials.first.clone()),
        Topic::Wave => Ok(Payload::truncated(WAVE_REPLY)),
        Topic::Ping => Err(UnreachableState::Topic(Topic::Ping)),
    }
}

/// Exchange state for one node. Shared between the transmit and receive tasks behind a mutex.
#[derive(Debug)]
pub struct ProtocolEngine {
    role: Role,
    outgoing: Packet,
    incoming: Packet,
    credentials: CredentialBundle,
    just_started: bool,
    exchange_complete: bool,
}

impl ProtocolEngine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            outgoing: Packet::placeholder("Nothing outgoing"),
            incoming: Packet::placeholder("Nothing incoming"),
            credentials: CredentialBundle::default(),
            just_started: true,
            exchange_complete: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn outgoing(&self) -> &Packet {
        &self.outgoing
    }

    pub fn incoming(&self) -> &Packet {
        &self.incoming
    }

    pub fn credentials(&self) -> &CredentialBundle {
        &self.credentials
    }

    pub fn set_credentials(&mut self, credentials: CredentialBundle) {
        self.credentials = credentials;
    }

    pub fn is_exchange_complete(&self) -> bool {
        self.exchange_complete
    }

    pub fn is_just_started(&self) -> bool {
        self.just_started
    }

    /// Store a freshly decoded packet as the last incoming one.
    pub fn record_incoming(&mut self, packet: Packet) {
        self.incoming = packet;
    }

    /// Next topic. The first call after construction returns Handshake and clears `just_started`.
    pub fn next_topic_to_send(&mut self) -> Topic {
        if self.just_started {
            self.just_started = false;
            return Topic::Handshake;
        }
        match next_topic(self.outgoing.topic) {
            Ok(Topic::Wave) => {
                self.mark_complete();
                Topic::Wave
            }
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "unreachable protocol state, resetting to handshake");
                Topic::Handshake
            }
        }
    }

    /// Next ack: mirror of the last incoming topic.
    pub fn next_ack_to_send(&mut self) -> AckTopic {
        let ack = ack_for(self.incoming.topic);
        if ack == AckTopic::ReceivedWave {
            self.mark_complete();
        }
        ack
    }

    /// Next payload for this node's role.
    pub fn next_payload(&mut self) -> Payload {
        let next = match self.role {
            Role::Master => {
                let ack = self.incoming.ack;
                if ack == AckTopic::ReceivedWave {
                    self.mark_complete();
                }
                master_payload(ack, &self.credentials)
            }
            Role::Slave => {
                let topic = self.incoming.topic;
                if topic == Topic::Wave {
                    self.mark_complete();
                }
                slave_payload(topic, &self.credentials)
            }
        };
        next.unwrap_or_else(|e| {
            error!(error = %e, "unreachable protocol state, sending empty payload");
            Payload::empty()
        })
    }

    /// Compute topic, ack and payload (in that order) and record the result as outgoing.
    pub fn prepare_outgoing(&mut self) -> Packet {
        let topic = self.next_topic_to_send();
        let ack = self.next_ack_to_send();
        let payload = self.next_payload();
        self.outgoing = Packet::new(topic, ack, payload);
        self.outgoing.clone()
    }

    /// Set-once. Returns true only for the call that flipped the flag.
    fn mark_complete(&mut self) -> bool {
        if self.exchange_complete {
            return false;
        }
        self.exchange_complete = true;
        info!(role = ?self.role, "credential exchange complete");
        true
    }
}
