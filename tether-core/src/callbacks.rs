//! Handler registry: one handler per slot, validated against the node's role.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use crate::engine::ProtocolEngine;
use crate::protocol::{AckTopic, Packet, Role, Topic};

/// Error returned by a handler; the round does not advance.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler rejected payload: {0}")]
    Rejected(String),
    #[error("station association failed: {0}")]
    Station(#[from] StationError),
}

impl HandlerError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        HandlerError::Rejected(msg.into())
    }
}

/// Reacts to one received payload. Runs on the blocking pool, so it may block.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, payload: &str) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&str) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        self(payload)
    }
}

/// What a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Handshake,
    Ssid,
    Password,
    CameraAddress,
    /// Generic fallback for every other topic or ack.
    Ack,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::Handshake => "handshake",
            Slot::Ssid => "ssid",
            Slot::Password => "password",
            Slot::CameraAddress => "camera-address",
            Slot::Ack => "ack",
        };
        f.write_str(name)
    }
}

impl Slot {
    /// Whether the application may register this slot on a node of `role`.
    pub fn allowed_for(self, role: Role) -> bool {
        match self {
            Slot::Ssid | Slot::Password => role == Role::Slave,
            Slot::CameraAddress => role == Role::Master,
            Slot::Handshake | Slot::Ack => true,
        }
    }

    /// Slots that must hold a handler before the node may start.
    pub fn required_for(role: Role) -> &'static [Slot] {
        match role {
            Role::Master => &[Slot::Handshake, Slot::Ack, Slot::CameraAddress],
            Role::Slave => &[Slot::Handshake, Slot::Ack, Slot::Ssid, Slot::Password],
        }
    }
}

/// Registration refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("{slot} handler cannot be registered on a {role:?} node")]
    WrongRole { slot: Slot, role: Role },
}

/// Which slot a received packet goes to.
///
/// Master dispatches on the slave's ack; Slave dispatches on the master's topic.
pub fn dispatch_slot(role: Role, incoming: &Packet) -> Slot {
    match role {
        Role::Master => match incoming.ack {
            AckTopic::ReceivedCameraAddress => Slot::CameraAddress,
            AckTopic::ReceivedWifiPassword => Slot::Password,
            AckTopic::ReceivedHandshake => Slot::Handshake,
            _ => Slot::Ack,
        },
        Role::Slave => match incoming.topic {
            Topic::WifiSsid => Slot::Ssid,
            Topic::WifiPassword => Slot::Password,
            Topic::Handshake => Slot::Handshake,
            _ => Slot::Ack,
        },
    }
}

fn accept(_payload: &str) -> Result<(), HandlerError> {
    Ok(())
}

pub struct CallbackRegistry {
    role: Role,
    handlers: HashMap<Slot, Arc<dyn Handler>>,
}

impl CallbackRegistry {
    /// Registry with the built-in handshake and ack handlers in place.
    pub fn new(role: Role) -> Self {
        let mut handlers: HashMap<Slot, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(Slot::Handshake, Arc::new(accept));
        handlers.insert(Slot::Ack, Arc::new(accept));
        Self { role, handlers }
    }

    pub fn register(&mut self, slot: Slot, handler: Arc<dyn Handler>) -> Result<(), RegisterError> {
        if !slot.allowed_for(self.role) {
            return Err(RegisterError::WrongRole {
                slot,
                role: self.role,
            });
        }
        self.handlers.insert(slot, handler);
        Ok(())
    }

    /// Install a built-in without the role check.
    pub(crate) fn install(&mut self, slot: Slot, handler: Arc<dyn Handler>) {
        self.handlers.insert(slot, handler);
    }

    pub fn get(&self, slot: Slot) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&slot).cloned()
    }

    /// First required slot without a handler, if any.
    pub fn missing(&self) -> Option<Slot> {
        Slot::required_for(self.role)
            .iter()
            .copied()
            .find(|slot| !self.handlers.contains_key(slot))
    }
}

/// Station association failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StationError(pub String);

impl StationError {
    pub fn new(msg: impl Into<String>) -> Self {
        StationError(msg.into())
    }
}

/// Joins the device to a Wi-Fi network. Blocks until associated or failed.
pub trait Station: Send + Sync + 'static {
    fn associate(&self, ssid: &str, password: &str) -> Result<(), StationError>;
}

impl<F> Station for F
where
    F: Fn(&str, &str) -> Result<(), StationError> + Send + Sync + 'static,
{
    fn associate(&self, ssid: &str, password: &str) -> Result<(), StationError> {
        self(ssid, password)
    }
}

/// Master's built-in password handler: once the slave holds the password, join the
/// same network with this node's own credentials.
pub(crate) struct StationHandler {
    engine: Arc<Mutex<ProtocolEngine>>,
    station: Arc<dyn Station>,
    settle: Duration,
}

impl StationHandler {
    pub(crate) fn new(
        engine: Arc<Mutex<ProtocolEngine>>,
        station: Arc<dyn Station>,
        settle: Duration,
    ) -> Self {
        Self {
            engine,
            station,
            settle,
        }
    }
}

impl Handler for StationHandler {
    fn handle(&self, _payload: &str) -> Result<(), HandlerError> {
        info!("slave holds the password, joining the network");
        std::thread::sleep(self.settle);
        let credentials = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .credentials()
            .clone();
        self.station
            .associate(credentials.first.as_str(), credentials.second.as_str())?;
        info!(ssid = %credentials.first, "station associated");
        std::thread::sleep(self.settle);
        Ok(())
    }
}
