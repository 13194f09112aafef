//! Persistent configuration store.
//!
//! A small key/value abstraction with an in-memory and a directory-backed
//! implementation, plus [`ConfigStore`], which knows the gateway's keys:
//! the versioned port snapshot, the control endpoint settings, Wi-Fi
//! credentials, and the AP-forced-off flag.
//!
//! Snapshot layout: one version byte (currently 1), a 32-bit
//! little-endian port count, then `count` fixed-size records carrying the
//! `PortConfig` fields in declaration order. Any version or size mismatch
//! invalidates the whole blob and the loader reports nothing, so callers
//! fall back to boot defaults.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Buf, BufMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use portgate_serial::{DataBits, FlowControl, Parity, SerialParams, StopBits, UartBinding};

use crate::config::{ControlConfig, PortConfig, PortMode};
use crate::registry::ChangeEvent;

pub const SNAPSHOT_VERSION: u8 = 1;
/// Fixed bytes per port record.
pub const PORT_RECORD_LEN: usize = 30;

const KEY_PORTS: &str = "ports_blob";
const KEY_CONTROL_PORT: &str = "ctrl_port";
const KEY_CONTROL_BACKLOG: &str = "ctrl_backlog";
const KEY_WIFI_SSID: &str = "wifi_ssid";
const KEY_WIFI_PASSWORD: &str = "wifi_pass";
const KEY_AP_FORCED_OFF: &str = "wifi_ap_force";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Key/value backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Minimal blob store. Failures are the caller's to log; `get` folds
/// "missing" and "unreadable" into `None`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: &[u8]) -> bool;
    fn remove(&self, key: &str) -> bool;
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryKv {
    map: StdMutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &[u8]) -> bool {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        true
    }

    fn remove(&self, key: &str) -> bool {
        self.map.lock().unwrap().remove(key).is_some()
    }
}

/// Directory-backed store: one file per key, written to a temporary file
/// and renamed into place so a snapshot is never half-visible.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { dir: dir.into() })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(key)).ok()
    }

    fn put(&self, key: &str, value: &[u8]) -> bool {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            log::warn!("[store] cannot create {}: {}", self.dir.display(), e);
            return false;
        }
        let tmp = self.path(&format!("{}.tmp", key));
        if let Err(e) = std::fs::write(&tmp, value) {
            log::warn!("[store] write {} failed: {}", tmp.display(), e);
            return false;
        }
        if let Err(e) = std::fs::rename(&tmp, self.path(key)) {
            log::warn!("[store] rename for {} failed: {}", key, e);
            return false;
        }
        true
    }

    fn remove(&self, key: &str) -> bool {
        std::fs::remove_file(self.path(key)).is_ok()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshot codec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn encode_record(buf: &mut Vec<u8>, cfg: &PortConfig) {
    buf.put_u16_le(cfg.port_id);
    buf.put_u16_le(cfg.tcp_port);
    buf.put_u16_le(cfg.tcp_backlog);
    buf.put_u8(cfg.uart.uart_num);
    buf.put_i16_le(cfg.uart.tx_pin);
    buf.put_i16_le(cfg.uart.rx_pin);
    buf.put_i16_le(cfg.uart.rts_pin);
    buf.put_i16_le(cfg.uart.cts_pin);
    buf.put_u32_le(cfg.params.baud);
    buf.put_u8(cfg.params.data_bits.value());
    buf.put_u8(cfg.params.parity.value());
    buf.put_u8(cfg.params.stop_bits.value());
    buf.put_u8(cfg.params.flow_control.value());
    buf.put_u8(cfg.mode.value());
    buf.put_u32_le(cfg.idle_timeout_ms);
    buf.put_u8(cfg.enabled as u8);
    buf.put_u8(cfg.max_sessions);
}

fn decode_record(buf: &mut &[u8]) -> Option<PortConfig> {
    let port_id = buf.get_u16_le();
    let tcp_port = buf.get_u16_le();
    let tcp_backlog = buf.get_u16_le();
    let uart_num = buf.get_u8();
    let tx_pin = buf.get_i16_le();
    let rx_pin = buf.get_i16_le();
    let rts_pin = buf.get_i16_le();
    let cts_pin = buf.get_i16_le();
    let baud = buf.get_u32_le();
    let data_bits = DataBits::from_value(buf.get_u8())?;
    let parity = Parity::from_value(buf.get_u8())?;
    let stop_bits = StopBits::from_value(buf.get_u8())?;
    let flow_control = FlowControl::from_value(buf.get_u8())?;
    let mode = PortMode::from_value(buf.get_u8())?;
    let idle_timeout_ms = buf.get_u32_le();
    let enabled = buf.get_u8() != 0;
    let max_sessions = buf.get_u8();
    Some(PortConfig {
        port_id,
        tcp_port,
        tcp_backlog,
        uart: UartBinding {
            uart_num,
            tx_pin,
            rx_pin,
            rts_pin,
            cts_pin,
        },
        params: SerialParams {
            baud,
            data_bits,
            parity,
            stop_bits,
            flow_control,
        },
        mode,
        idle_timeout_ms,
        enabled,
        max_sessions,
    })
}

/// Serialise a port snapshot.
pub fn encode_snapshot(ports: &[PortConfig]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + ports.len() * PORT_RECORD_LEN);
    buf.put_u8(SNAPSHOT_VERSION);
    buf.put_u32_le(ports.len() as u32);
    for cfg in ports {
        encode_record(&mut buf, cfg);
    }
    buf
}

/// Deserialise a port snapshot. Any mismatch — wrong version, count not
/// matching the blob length, or an undecodable field — invalidates the
/// whole blob.
pub fn decode_snapshot(blob: &[u8]) -> Option<Vec<PortConfig>> {
    let mut buf = blob;
    if buf.remaining() < 5 {
        return None;
    }
    if buf.get_u8() != SNAPSHOT_VERSION {
        return None;
    }
    let count = buf.get_u32_le() as usize;
    if buf.remaining() != count * PORT_RECORD_LEN {
        return None;
    }
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        ports.push(decode_record(&mut buf)?);
    }
    Some(ports)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Config store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gateway-aware view over a [`KvStore`].
#[derive(Clone)]
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
}

impl ConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn load_ports(&self) -> Option<Vec<PortConfig>> {
        let blob = self.kv.get(KEY_PORTS)?;
        match decode_snapshot(&blob) {
            Some(ports) => Some(ports),
            None => {
                log::warn!("[store] stored port snapshot is invalid, ignoring");
                None
            }
        }
    }

    pub fn save_ports(&self, ports: &[PortConfig]) -> bool {
        self.kv.put(KEY_PORTS, &encode_snapshot(ports))
    }

    pub fn clear_ports(&self) {
        self.kv.remove(KEY_PORTS);
    }

    pub fn load_control(&self) -> Option<ControlConfig> {
        let port_bytes = self.kv.get(KEY_CONTROL_PORT)?;
        let backlog_bytes = self.kv.get(KEY_CONTROL_BACKLOG)?;
        if port_bytes.len() != 2 || backlog_bytes.len() != 4 {
            log::warn!("[store] stored control settings are invalid, ignoring");
            return None;
        }
        Some(ControlConfig {
            tcp_port: u16::from_le_bytes([port_bytes[0], port_bytes[1]]),
            backlog: i32::from_le_bytes([
                backlog_bytes[0],
                backlog_bytes[1],
                backlog_bytes[2],
                backlog_bytes[3],
            ]),
        })
    }

    pub fn save_control(&self, cfg: &ControlConfig) -> bool {
        self.kv.put(KEY_CONTROL_PORT, &cfg.tcp_port.to_le_bytes())
            && self
                .kv
                .put(KEY_CONTROL_BACKLOG, &cfg.backlog.to_le_bytes())
    }

    pub fn load_wifi_credentials(&self) -> Option<(String, String)> {
        let ssid = String::from_utf8(self.kv.get(KEY_WIFI_SSID)?).ok()?;
        if ssid.is_empty() {
            return None;
        }
        let password = self
            .kv
            .get(KEY_WIFI_PASSWORD)
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default();
        Some((ssid, password))
    }

    pub fn save_wifi_credentials(&self, ssid: &str, password: &str) -> bool {
        self.kv.put(KEY_WIFI_SSID, ssid.as_bytes())
            && self.kv.put(KEY_WIFI_PASSWORD, password.as_bytes())
    }

    pub fn clear_wifi_credentials(&self) {
        self.kv.remove(KEY_WIFI_SSID);
        self.kv.remove(KEY_WIFI_PASSWORD);
    }

    pub fn load_ap_forced_off(&self) -> Option<bool> {
        let bytes = self.kv.get(KEY_AP_FORCED_OFF)?;
        Some(bytes.first().copied().unwrap_or(0) != 0)
    }

    pub fn save_ap_forced_off(&self, forced_off: bool) -> bool {
        self.kv.put(KEY_AP_FORCED_OFF, &[forced_off as u8])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshot writer task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Consume registry change events and persist port snapshots. A failed
/// write is retried once after a short delay; persistence never blocks a
/// registry mutation.
pub fn spawn_snapshot_writer(
    store: ConfigStore,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if store.save_ports(&event.ports) {
                log::debug!(
                    "[store] persisted {} ports (epoch {})",
                    event.ports.len(),
                    event.epoch
                );
                continue;
            }
            log::warn!("[store] persist failed (epoch {}), retrying", event.epoch);
            tokio::time::sleep(Duration::from_millis(500)).await;
            if !store.save_ports(&event.ports) {
                log::error!("[store] persist retry failed (epoch {})", event.epoch);
            }
        }
    })
}
