//! Runtime registry — the authoritative set of configured ports and live
//! sessions.
//!
//! All mutations are serialised by one async operation lock; the inner
//! state sits behind a plain mutex that is never held across an await.
//! Readers take snapshot copies under that mutex and release it before
//! returning. Sessions never touch the registry: they see configuration
//! through handed-in snapshots and mailbox messages only.
//!
//! Every successful mutation bumps the change epoch and emits a
//! [`ChangeEvent`] carrying a full port snapshot; the persistence writer
//! consumes these.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use portgate_serial::{SerialParams, UartBinding, UartDriver};

use crate::config::{PortConfig, PortMode};
use crate::error::{GatewayError, Result};
use crate::listener;
use crate::net::Acceptor;
use crate::session::{ActiveSessionView, SessionTable};

/// Emitted after each successful mutation.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub epoch: u64,
    pub ports: Vec<PortConfig>,
}

struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct PortSlot {
    cfg: PortConfig,
    listener: Option<ListenerHandle>,
}

#[derive(Default)]
struct RegistryInner {
    /// Insertion order is the iteration order observers see.
    ports: Vec<PortSlot>,
    epoch: u64,
}

pub struct Registry {
    driver: Arc<dyn UartDriver>,
    /// Serialises every mutating operation end to end, including listener
    /// bind/teardown.
    op_lock: Mutex<()>,
    inner: StdMutex<RegistryInner>,
    sessions: Arc<SessionTable>,
    change_tx: StdMutex<Option<mpsc::UnboundedSender<ChangeEvent>>>,
}

impl Registry {
    pub fn new(driver: Arc<dyn UartDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            op_lock: Mutex::new(()),
            inner: StdMutex::new(RegistryInner::default()),
            sessions: SessionTable::new(),
            change_tx: StdMutex::new(None),
        })
    }

    /// Register the change-event consumer (typically the persistence
    /// writer). One consumer; a later call replaces the earlier one.
    pub fn set_change_listener(&self, tx: mpsc::UnboundedSender<ChangeEvent>) {
        *self.change_tx.lock().unwrap() = Some(tx);
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Snapshot of all configured ports in insertion order.
    pub fn copy_ports(&self) -> Vec<PortConfig> {
        let inner = self.inner.lock().unwrap();
        inner.ports.iter().map(|s| s.cfg.clone()).collect()
    }

    /// Snapshot of one port.
    pub fn find_port(&self, tcp_port: u16) -> Option<PortConfig> {
        let inner = self.inner.lock().unwrap();
        inner
            .ports
            .iter()
            .find(|s| s.cfg.tcp_port == tcp_port)
            .map(|s| s.cfg.clone())
    }

    /// Snapshot views of all live sessions.
    pub fn list_sessions(&self) -> Vec<ActiveSessionView> {
        self.sessions.views()
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Add a port and, when enabled, start its listener. Returns the
    /// bound TCP port (resolved when the config asked for an ephemeral
    /// one).
    pub async fn add_port(&self, mut cfg: PortConfig) -> Result<u16> {
        let _op = self.op_lock.lock().await;
        cfg.validate(self.driver.max_pin())?;
        self.check_uniqueness(&cfg)?;

        let handle = if cfg.enabled {
            Some(self.start_listener(&mut cfg).await?)
        } else {
            None
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.ports.push(PortSlot {
                cfg: cfg.clone(),
                listener: handle,
            });
        }
        log::info!(
            "[registry] added port {} on tcp {} (UART{}, {})",
            cfg.port_id,
            cfg.tcp_port,
            cfg.uart.uart_num,
            cfg.mode.label()
        );
        self.emit_change();
        Ok(cfg.tcp_port)
    }

    /// Remove a port: stop its listener first, then cancel any live
    /// sessions, then drop the entry.
    pub async fn remove_port(&self, tcp_port: u16) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            match inner.ports.iter().position(|s| s.cfg.tcp_port == tcp_port) {
                Some(idx) => inner.ports.remove(idx),
                None => return Err(GatewayError::not_found(tcp_port)),
            }
        };
        if let Some(handle) = slot.listener {
            Self::stop_listener(handle, tcp_port).await;
        }
        self.sessions.cancel_port(tcp_port);
        log::info!("[registry] removed port {} (tcp {})", slot.cfg.port_id, tcp_port);
        self.emit_change();
        Ok(())
    }

    /// Update a port's serial configuration. `apply_active` dispatches a
    /// live reconfig to running sessions; pin overrides require the port
    /// to be quiescent.
    pub async fn update_serial_config(
        &self,
        tcp_port: u16,
        params: SerialParams,
        idle_timeout_ms: Option<u32>,
        apply_active: bool,
        pin_overrides: Option<UartBinding>,
    ) -> Result<()> {
        let _op = self.op_lock.lock().await;

        if params.baud == 0 {
            return Err(GatewayError::invalid("baud rate must be nonzero"));
        }
        if let Some(binding) = &pin_overrides {
            if !binding.pins_valid(self.driver.max_pin()) {
                return Err(GatewayError::invalid("pin assignment out of range"));
            }
            if self.sessions.count_for_port(tcp_port) > 0 {
                return Err(GatewayError::conflict(
                    "pin overrides require no active session",
                ));
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            // Re-binding to a different peripheral must not collide with
            // another enabled port.
            if let Some(binding) = &pin_overrides {
                let clash = inner.ports.iter().any(|s| {
                    s.cfg.tcp_port != tcp_port
                        && s.cfg.enabled
                        && s.cfg.uart.uart_num == binding.uart_num
                });
                if clash {
                    return Err(GatewayError::invalid(format!(
                        "UART{} is bound to another enabled port",
                        binding.uart_num
                    )));
                }
            }
            let slot = inner
                .ports
                .iter_mut()
                .find(|s| s.cfg.tcp_port == tcp_port)
                .ok_or_else(|| GatewayError::not_found(tcp_port))?;
            slot.cfg.params = params;
            if let Some(idle) = idle_timeout_ms {
                slot.cfg.idle_timeout_ms = idle;
            }
            if let Some(binding) = pin_overrides {
                slot.cfg.uart = binding;
            }
        }

        if apply_active {
            if self.sessions.reconfig_port(tcp_port, params) {
                log::info!(
                    "[registry] dispatched live reconfig on tcp {} ({})",
                    tcp_port,
                    params.shorthand()
                );
            }
        }
        self.emit_change();
        Ok(())
    }

    /// Change a port's mode and enablement. Disabling stops the listener
    /// and cancels sessions; a mode change cancels running sessions so
    /// the next accept uses the new mode.
    pub async fn set_port_mode(&self, tcp_port: u16, mode: PortMode, enabled: bool) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let (was_enabled, mode_changed, old_listener, mut cfg) = {
            let mut inner = self.inner.lock().unwrap();
            let slot = inner
                .ports
                .iter_mut()
                .find(|s| s.cfg.tcp_port == tcp_port)
                .ok_or_else(|| GatewayError::not_found(tcp_port))?;
            let was_enabled = slot.cfg.enabled;
            let mode_changed = slot.cfg.mode != mode;
            slot.cfg.mode = mode;
            slot.cfg.enabled = enabled;
            let listener = if was_enabled && !enabled {
                slot.listener.take()
            } else {
                None
            };
            (was_enabled, mode_changed, listener, slot.cfg.clone())
        };

        if let Some(handle) = old_listener {
            Self::stop_listener(handle, tcp_port).await;
            self.sessions.disable_port(tcp_port);
        } else if mode_changed && self.sessions.cancel_port(tcp_port) {
            log::info!(
                "[registry] mode change on tcp {} cancelled live sessions",
                tcp_port
            );
        }

        if !was_enabled && enabled {
            let handle = self.start_listener(&mut cfg).await?;
            let mut inner = self.inner.lock().unwrap();
            if let Some(slot) = inner.ports.iter_mut().find(|s| s.cfg.tcp_port == tcp_port) {
                slot.listener = Some(handle);
            }
        }

        self.emit_change();
        Ok(())
    }

    /// Cancel any live session on the port. Returns whether one existed.
    /// Not a configuration change, so no change event.
    pub fn disconnect_tcp_port(&self, tcp_port: u16) -> bool {
        let existed = self.sessions.cancel_port(tcp_port);
        if existed {
            log::info!("[registry] disconnect requested on tcp {}", tcp_port);
        }
        existed
    }

    /// Stop all listeners and cancel all sessions.
    pub async fn shutdown(&self) {
        let _op = self.op_lock.lock().await;
        let handles: Vec<(u16, ListenerHandle)> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .ports
                .iter_mut()
                .filter_map(|s| s.listener.take().map(|h| (s.cfg.tcp_port, h)))
                .collect()
        };
        for (tcp_port, handle) in handles {
            Self::stop_listener(handle, tcp_port).await;
        }
        self.sessions.cancel_all();
        log::info!("[registry] shut down");
    }

    // ── Internals ───────────────────────────────────────────────────

    fn check_uniqueness(&self, cfg: &PortConfig) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        for slot in &inner.ports {
            if cfg.tcp_port != 0 && slot.cfg.tcp_port == cfg.tcp_port {
                return Err(GatewayError::already_exists(format!(
                    "tcp {} is already configured",
                    cfg.tcp_port
                )));
            }
            if slot.cfg.port_id == cfg.port_id {
                return Err(GatewayError::already_exists(format!(
                    "port id {} is already configured",
                    cfg.port_id
                )));
            }
            if cfg.enabled && slot.cfg.enabled && slot.cfg.uart.uart_num == cfg.uart.uart_num {
                return Err(GatewayError::invalid(format!(
                    "UART{} is bound to another enabled port",
                    cfg.uart.uart_num
                )));
            }
        }
        Ok(())
    }

    async fn start_listener(&self, cfg: &mut PortConfig) -> Result<ListenerHandle> {
        let acceptor = Acceptor::bind(cfg.tcp_port, cfg.tcp_backlog)
            .await
            .map_err(|e| {
                GatewayError::io_fatal(format!("bind tcp {} failed: {}", cfg.tcp_port, e))
            })?;
        cfg.tcp_port = acceptor.port();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener::run_listener(
            acceptor,
            cfg.clone(),
            self.driver.clone(),
            self.sessions.clone(),
            shutdown_rx,
        ));
        Ok(ListenerHandle { shutdown, task })
    }

    /// Stop a listener and wait for its socket to be fully released, so a
    /// follow-up bind of the same port cannot race it.
    async fn stop_listener(handle: ListenerHandle, tcp_port: u16) {
        let _ = handle.shutdown.send(true);
        if handle.task.await.is_err() {
            log::warn!("[registry] listener task for tcp {} panicked", tcp_port);
        }
    }

    fn emit_change(&self) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.epoch += 1;
            ChangeEvent {
                epoch: inner.epoch,
                ports: inner.ports.iter().map(|s| s.cfg.clone()).collect(),
            }
        };
        let tx = self.change_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            if tx.send(event).is_err() {
                log::warn!("[registry] change listener is gone");
            }
        }
    }
}
