//! Joining a Wi-Fi network from the daemon.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::process::Command;

use tether_core::{Station, StationError};
use tracing::{info, warn};

/// Runs a configured program to associate, e.g.
/// `nmcli device wifi connect {ssid} password {password}`. Arguments are split on
/// whitespace and passed directly, never through a shell. With no program
/// configured, association is only logged.
#[derive(Debug, Clone, Default)]
pub struct CommandStation {
    template: Option<Vec<String>>,
}

impl CommandStation {
    pub fn new(command: Option<&str>) -> Self {
        let template = command
            .map(|c| c.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|parts| !parts.is_empty());
        Self { template }
    }

    /// Program and arguments with placeholders filled in.
    fn render(&self, ssid: &str, password: &str) -> Option<Vec<String>> {
        self.template.as_ref().map(|parts| {
            parts
                .iter()
                .map(|p| p.replace("{ssid}", ssid).replace("{password}", password))
                .collect()
        })
    }
}

impl Station for CommandStation {
    fn associate(&self, ssid: &str, password: &str) -> Result<(), StationError> {
        let Some(argv) = self.render(ssid, password) else {
            info!(ssid, "no station command configured, assuming associated");
            return Ok(());
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StationError::new("empty station command"))?;
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| StationError::new(format!("running {program}: {e}")))?;
        if status.success() {
            info!(ssid, "associated");
            Ok(())
        } else {
            warn!(ssid, %status, "station command failed");
            Err(StationError::new(format!("{program} exited with {status}")))
        }
    }
}

/// The local address the kernel would use to reach `probe`. No packet is sent.
pub fn resolve_local_addr(probe: SocketAddr) -> io::Result<IpAddr> {
    let unspecified: SocketAddr = match probe {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(unspecified)?;
    socket.connect(probe)?;
    Ok(socket.local_addr()?.ip())
}
