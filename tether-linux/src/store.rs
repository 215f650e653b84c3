//! What this daemon has learned from its peer.

use std::sync::{Arc, PoisonError, RwLock};

use tether_core::{Handler, HandlerError};
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Learned {
    ssid: Option<String>,
    password: Option<String>,
    camera_address: Option<String>,
}

/// Shared between the node's handlers (writers) and the watchdog and `main` (readers).
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: RwLock<Learned>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut Learned)) {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn read<T>(&self, f: impl FnOnce(&Learned) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn set_ssid(&self, ssid: &str) {
        self.update(|l| l.ssid = Some(ssid.to_string()));
    }

    pub fn set_password(&self, password: &str) {
        self.update(|l| l.password = Some(password.to_string()));
    }

    pub fn set_camera_address(&self, address: &str) {
        self.update(|l| l.camera_address = Some(address.to_string()));
    }

    pub fn ssid(&self) -> Option<String> {
        self.read(|l| l.ssid.clone())
    }

    pub fn camera_address(&self) -> Option<String> {
        self.read(|l| l.camera_address.clone())
    }

    /// Network name and password, once both have arrived.
    pub fn network(&self) -> Option<(String, String)> {
        self.read(|l| Some((l.ssid.clone()?, l.password.clone()?)))
    }

    pub fn ssid_handler(self: &Arc<Self>) -> impl Handler {
        let store = self.clone();
        move |ssid: &str| -> Result<(), HandlerError> {
            info!(ssid, "network name received");
            store.set_ssid(ssid);
            Ok(())
        }
    }

    pub fn password_handler(self: &Arc<Self>) -> impl Handler {
        let store = self.clone();
        move |password: &str| -> Result<(), HandlerError> {
            info!(len = password.len(), "network password received");
            store.set_password(password);
            Ok(())
        }
    }

    pub fn camera_address_handler(self: &Arc<Self>) -> impl Handler {
        let store = self.clone();
        move |address: &str| -> Result<(), HandlerError> {
            info!(address, "camera address received");
            store.set_camera_address(address);
            Ok(())
        }
    }
}
