//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tether_core::{MacAddress, NodeConfig, Role, DEFAULT_CHANNEL};

use crate::watchdog::WatchdogConfig;

const MASTER_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const SLAVE_MAC: MacAddress = MacAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
const MASTER_PORT: u16 = 47600;
const SLAVE_PORT: u16 = 47601;

/// Daemon configuration. File: ~/.config/tether/config.toml or /etc/tether/config.toml.
/// Env overrides: TETHER_ROLE, TETHER_PEER_MAC, TETHER_LOCAL_MAC, TETHER_BIND,
/// TETHER_PEER_ADDR, TETHER_CHANNEL, TETHER_POLL_MS, TETHER_VALUE1, TETHER_VALUE2.
///
/// Addresses left unset default by role, so a master and a slave on one host find
/// each other over loopback with no configuration beyond the role and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub local_mac: Option<MacAddress>,
    #[serde(default)]
    pub peer_mac: Option<MacAddress>,
    /// UDP address the emulated radio listens on.
    #[serde(default)]
    pub bind: Option<SocketAddr>,
    /// UDP address of the peer's emulated radio.
    #[serde(default)]
    pub peer_addr: Option<SocketAddr>,
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_association_settle_ms")]
    pub association_settle_ms: u64,
    /// Master: network name. Slave: initial address.
    #[serde(default)]
    pub value1: Option<String>,
    /// Master: network password. Slave: secondary value.
    #[serde(default)]
    pub value2: Option<String>,
    /// Program run to join a network; `{ssid}` and `{password}` are substituted.
    #[serde(default)]
    pub station_command: Option<String>,
    #[serde(default = "default_watchdog_poll_ms")]
    pub watchdog_poll_ms: u64,
    #[serde(default = "default_watchdog_grace_ms")]
    pub watchdog_grace_ms: u64,
    #[serde(default = "default_watchdog_settle_ms")]
    pub watchdog_settle_ms: u64,
    /// Any routable address; only used to learn which local address faces it.
    #[serde(default = "default_probe_addr")]
    pub probe_addr: SocketAddr,
}

fn default_role() -> Role {
    Role::Slave
}
fn default_channel() -> u8 {
    DEFAULT_CHANNEL
}
fn default_poll_ms() -> u64 {
    2_000
}
fn default_association_settle_ms() -> u64 {
    10_000
}
fn default_watchdog_poll_ms() -> u64 {
    1_000
}
fn default_watchdog_grace_ms() -> u64 {
    5_000
}
fn default_watchdog_settle_ms() -> u64 {
    10_000
}
fn default_probe_addr() -> SocketAddr {
    SocketAddr::from(([192, 0, 2, 1], 80))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            local_mac: None,
            peer_mac: None,
            bind: None,
            peer_addr: None,
            channel: default_channel(),
            poll_ms: default_poll_ms(),
            association_settle_ms: default_association_settle_ms(),
            value1: None,
            value2: None,
            station_command: None,
            watchdog_poll_ms: default_watchdog_poll_ms(),
            watchdog_grace_ms: default_watchdog_grace_ms(),
            watchdog_settle_ms: default_watchdog_settle_ms(),
            probe_addr: default_probe_addr(),
        }
    }
}

impl Config {
    fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn local_mac(&self) -> MacAddress {
        self.local_mac
            .unwrap_or(if self.is_master() { MASTER_MAC } else { SLAVE_MAC })
    }

    pub fn peer_mac(&self) -> MacAddress {
        self.peer_mac
            .unwrap_or(if self.is_master() { SLAVE_MAC } else { MASTER_MAC })
    }

    pub fn bind(&self) -> SocketAddr {
        let port = if self.is_master() { MASTER_PORT } else { SLAVE_PORT };
        self.bind.unwrap_or(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        let port = if self.is_master() { SLAVE_PORT } else { MASTER_PORT };
        self.peer_addr.unwrap_or(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            channel: self.channel,
            poll_interval: Duration::from_millis(self.poll_ms),
            association_settle: Duration::from_millis(self.association_settle_ms),
            ..NodeConfig::new(self.peer_mac())
        }
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            poll: Duration::from_millis(self.watchdog_poll_ms),
            grace: Duration::from_millis(self.watchdog_grace_ms),
            settle: Duration::from_millis(self.watchdog_settle_ms),
            probe: self.probe_addr,
        }
    }

    /// The two values handed to the peer. A master must be given both; a slave
    /// starts with a placeholder address that the watchdog replaces.
    pub fn credentials(&self) -> anyhow::Result<(String, String)> {
        match self.role {
            Role::Master => match (&self.value1, &self.value2) {
                (Some(ssid), Some(password)) => Ok((ssid.clone(), password.clone())),
                _ => bail!("a master needs value1 (network name) and value2 (password)"),
            },
            Role::Slave => Ok((
                self.value1.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                self.value2.clone().unwrap_or_default(),
            )),
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(s) = lookup("TETHER_ROLE") {
            self.role = match s.to_ascii_lowercase().as_str() {
                "master" => Role::Master,
                "slave" => Role::Slave,
                other => bail!("TETHER_ROLE must be master or slave, got {other:?}"),
            };
        }
        if let Some(s) = lookup("TETHER_PEER_MAC") {
            self.peer_mac = Some(s.parse().context("TETHER_PEER_MAC")?);
        }
        if let Some(s) = lookup("TETHER_LOCAL_MAC") {
            self.local_mac = Some(s.parse().context("TETHER_LOCAL_MAC")?);
        }
        if let Some(s) = lookup("TETHER_BIND") {
            self.bind = Some(s.parse().context("TETHER_BIND")?);
        }
        if let Some(s) = lookup("TETHER_PEER_ADDR") {
            self.peer_addr = Some(s.parse().context("TETHER_PEER_ADDR")?);
        }
        if let Some(s) = lookup("TETHER_CHANNEL") {
            self.channel = s.parse().context("TETHER_CHANNEL")?;
        }
        if let Some(s) = lookup("TETHER_POLL_MS") {
            self.poll_ms = s.parse().context("TETHER_POLL_MS")?;
        }
        if let Some(s) = lookup("TETHER_VALUE1") {
            self.value1 = Some(s);
        }
        if let Some(s) = lookup("TETHER_VALUE2") {
            self.value2 = Some(s);
        }
        Ok(())
    }
}

/// Load config: explicit path if given, else the first config file found, else
/// defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let file = match explicit {
        Some(path) => Some(read(path)?),
        None => load_file()?,
    };
    let mut c = file.unwrap_or_default();
    c.apply_env(|key| std::env::var(key).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tether/config.toml"));
    }
    out.push(PathBuf::from("/etc/tether/config.toml"));
    out
}

fn load_file() -> anyhow::Result<Option<Config>> {
    match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => read(&p).map(Some),
        None => Ok(None),
    }
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing {}", path.display()))
}

fn parse(s: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str(s)?)
}
