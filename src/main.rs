//! Gateway daemon entry point.
//!
//! Loads the JSON boot document, prefers a persisted port snapshot over
//! the boot defaults, starts the registry, persistence writer, and
//! control endpoint, then runs until interrupted.

use std::sync::Arc;

use tokio::sync::mpsc;

use portgate::config::BootConfig;
use portgate::control;
use portgate::persist::{spawn_snapshot_writer, ConfigStore, FileKv};
use portgate::registry::Registry;
use portgate_serial::SimulatedUartDriver;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let document = match std::fs::read_to_string(&config_path) {
        Ok(doc) => doc,
        Err(e) => {
            log::error!("cannot read {}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    let boot = match BootConfig::from_json(&document) {
        Ok(boot) => boot,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let store = ConfigStore::new(FileKv::new(&boot.store_dir));

    // A valid persisted snapshot wins over the boot defaults.
    let (ports, from_store) = match store.load_ports() {
        Some(ports) => (ports, true),
        None => (boot.ports.clone(), false),
    };
    log::info!(
        "starting with {} ports ({})",
        ports.len(),
        if from_store { "persisted" } else { "boot defaults" }
    );

    // Host builds drive the in-memory UART back-end; a device build
    // injects its hardware driver here instead.
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver);

    let (change_tx, change_rx) = mpsc::unbounded_channel();
    registry.set_change_listener(change_tx);
    let writer = spawn_snapshot_writer(store.clone(), change_rx);

    let started = start_ports(&registry, &ports).await;
    if started == 0 && from_store && !boot.ports.is_empty() {
        log::warn!("persisted ports all failed to start, falling back to boot defaults");
        store.clear_ports();
        start_ports(&registry, &boot.ports).await;
    }

    let control_handle = match &boot.control {
        Some(cfg) => match control::start(registry.clone(), cfg).await {
            Ok(handle) => {
                store.save_control(cfg);
                Some(handle)
            }
            Err(e) => {
                log::error!("control endpoint failed to start: {}", e);
                None
            }
        },
        None => None,
    };

    // Seed the store with the resolved configuration.
    if !store.save_ports(&registry.copy_ports()) {
        log::warn!("initial snapshot persist failed");
    }

    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("cannot listen for shutdown signal");
    }
    log::info!("shutting down");

    if let Some(handle) = control_handle {
        handle.stop().await;
    }
    registry.shutdown().await;
    writer.abort();
}

async fn start_ports(registry: &Arc<Registry>, ports: &[portgate::PortConfig]) -> usize {
    let mut started = 0;
    for cfg in ports {
        match registry.add_port(cfg.clone()).await {
            Ok(_) => started += 1,
            Err(e) => log::error!("port {} not started: {}", cfg.port_id, e),
        }
    }
    started
}
