// Tether Linux: one node of the pairing exchange over an emulated UDP radio.

mod config;
mod link;
mod logging;
mod station;
mod store;
mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tether_core::{Node, Role, StartError, Station, RESTART_DELAY};
use tracing::{error, info};

use crate::config::Config;
use crate::link::UdpLink;
use crate::station::CommandStation;
use crate::store::CredentialStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("tether-linux {}", VERSION);
                return Ok(());
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument {other:?}"),
        }
    }

    logging::init_from_env();
    let cfg = config::load(config_path.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let link = Arc::new(UdpLink::new(cfg.local_mac(), cfg.bind(), cfg.peer_addr()));
    let station: Arc<dyn Station> = Arc::new(CommandStation::new(cfg.station_command.as_deref()));
    let store = Arc::new(CredentialStore::new());

    let node = match cfg.role {
        Role::Master => {
            let node = Node::master(cfg.node_config(), link, station.clone());
            node.register_camera_address_handler(store.camera_address_handler())?;
            node
        }
        Role::Slave => {
            let node = Node::slave(cfg.node_config(), link);
            node.register_ssid_handler(store.ssid_handler())?;
            node.register_password_handler(store.password_handler())?;
            node
        }
    };
    let node = Arc::new(node);
    let (value1, value2) = cfg.credentials()?;
    node.add_credentials(&value1, &value2)?;

    match node.start() {
        Ok(()) => {}
        Err(StartError::TransportInit(e)) => {
            error!(
                error = %e,
                delay = ?RESTART_DELAY,
                "radio failed to start, exiting for restart"
            );
            tokio::time::sleep(RESTART_DELAY).await;
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }
    info!(
        version = VERSION,
        role = ?cfg.role,
        local = %node.local_mac(),
        peer = %node.peer_mac(),
        "tether running"
    );

    if cfg.role == Role::Slave {
        tokio::spawn(watchdog::run(node.clone(), store.clone(), station, cfg.watchdog()));
    }

    tokio::select! {
        r = shutdown_signal() => {
            r?;
            info!("shutdown requested");
        }
        _ = node.closed() => info!("exchange finished"),
    }
    node.end().await;

    if let Some(address) = store.camera_address() {
        info!(%address, "camera reachable");
    }
    if let Some(ssid) = store.ssid() {
        info!(%ssid, "network handed over by master");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). systemd restarts the unit on failure.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
