//! Per-port accept loop.
//!
//! One task per enabled port. Admission is checked against the live
//! session table before a session is spawned; an occupied port closes the
//! new socket immediately (RS-232 semantics: one client owns the line).

use std::sync::Arc;

use tokio::sync::watch;

use portgate_serial::UartDriver;

use crate::config::PortConfig;
use crate::net::Acceptor;
use crate::session::{self, SessionTable};

pub(crate) async fn run_listener(
    acceptor: Acceptor,
    cfg: PortConfig,
    driver: Arc<dyn UartDriver>,
    sessions: Arc<SessionTable>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(
        "[listener:{}] serving tcp {} for UART{} ({} mode)",
        cfg.port_id,
        cfg.tcp_port,
        cfg.uart.uart_num,
        cfg.mode.label()
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = acceptor.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("[listener:{}] accept failed: {}", cfg.port_id, e);
                        break;
                    }
                };
                let active = sessions.count_for_port(cfg.tcp_port);
                if active >= cfg.max_sessions as usize {
                    log::warn!(
                        "[listener:{}] refusing {}: tcp {} occupied ({}/{})",
                        cfg.port_id,
                        peer,
                        cfg.tcp_port,
                        active,
                        cfg.max_sessions
                    );
                    drop(stream);
                    continue;
                }
                session::spawn_session(stream, peer, cfg.clone(), driver.clone(), sessions.clone());
            }
        }
    }

    log::info!("[listener:{}] stopped (tcp {})", cfg.port_id, cfg.tcp_port);
}
