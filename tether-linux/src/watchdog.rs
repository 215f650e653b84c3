//! Slave provisioning: once the master has handed over the network name and
//! password, join that network and publish the address we got there.
//!
//! Transmission is paused for the whole association so the master's camera
//! address request is only answered with the new address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tether_core::{Node, Station};
use tracing::{info, warn};

use crate::station::resolve_local_addr;
use crate::store::CredentialStore;

/// Sent in place of an address when association or resolution failed.
pub const INVALID_ADDRESS: (&str, &str) = ("Invalid", "IP");

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How often to look for the network credentials.
    pub poll: Duration,
    /// Wait after both arrive, so the slave can acknowledge the password first.
    pub grace: Duration,
    /// Wait after re-registering before transmitting again.
    pub settle: Duration,
    pub probe: SocketAddr,
}

/// Runs once. Returns the address published to the master, if any.
pub async fn run(
    node: Arc<Node>,
    store: Arc<CredentialStore>,
    station: Arc<dyn Station>,
    config: WatchdogConfig,
) -> Option<IpAddr> {
    let (ssid, password) = loop {
        if let Some(network) = store.network() {
            break network;
        }
        tokio::time::sleep(config.poll).await;
    };
    info!(%ssid, grace = ?config.grace, "network credentials complete");
    tokio::time::sleep(config.grace).await;

    node.pause();
    let joined = {
        let ssid = ssid.clone();
        tokio::task::spawn_blocking(move || station.associate(&ssid, &password)).await
    };
    let address = match joined {
        Ok(Ok(())) => match resolve_local_addr(config.probe) {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(error = %e, "could not resolve local address");
                None
            }
        },
        Ok(Err(e)) => {
            warn!(%ssid, error = %e, "association failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "association task failed");
            None
        }
    };

    let published = match address {
        Some(ip) => node.add_credentials(&ip.to_string(), ""),
        None => node.add_credentials(INVALID_ADDRESS.0, INVALID_ADDRESS.1),
    };
    if let Err(e) = published {
        warn!(error = %e, "could not update credentials");
    }
    info!(address = ?address, "address published");

    if let Err(e) = node.reregister() {
        warn!(error = %e, "peer re-registration failed");
    }
    tokio::time::sleep(config.settle).await;
    node.unpause();
    address
}
