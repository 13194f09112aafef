//! Port and boot configuration.
//!
//! [`PortConfig`] is the unit the registry stores, validates, persists,
//! and hands to listeners and sessions. [`BootConfig`] is the JSON
//! document the binary loads at startup.

use portgate_serial::{SerialParams, UartBinding};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

// ── Port mode ───────────────────────────────────────────────────────────

/// Protocol spoken on a port's TCP side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMode {
    /// Byte-transparent, both directions.
    Raw,
    /// Byte-transparent, UART→TCP only (line-printer style); client bytes
    /// are discarded.
    #[serde(rename = "rawlp")]
    RawLp,
    /// RFC 854 telnet with RFC 2217 COM-port control.
    Telnet,
}

impl Default for PortMode {
    fn default() -> Self {
        Self::Raw
    }
}

impl PortMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::RawLp => "rawlp",
            Self::Telnet => "telnet",
        }
    }

    /// Stored encoding.
    pub fn value(&self) -> u8 {
        match self {
            Self::Raw => 0,
            Self::RawLp => 1,
            Self::Telnet => 2,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Raw),
            1 => Some(Self::RawLp),
            2 => Some(Self::Telnet),
            _ => None,
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "rawlp" => Some(Self::RawLp),
            "telnet" => Some(Self::Telnet),
            _ => None,
        }
    }
}

// ── Port configuration ──────────────────────────────────────────────────

/// One configured pairing of a UART peripheral with a TCP listen port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Stable small integer identity, unique across ports.
    pub port_id: u16,

    /// TCP listen port, unique across ports. 0 requests an ephemeral
    /// port, resolved when the listener binds.
    pub tcp_port: u16,

    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub tcp_backlog: u16,

    /// UART peripheral and pin assignment.
    pub uart: UartBinding,

    /// Framing applied when a session opens the UART.
    #[serde(default)]
    pub params: SerialParams,

    /// Protocol mode on the TCP side.
    #[serde(default)]
    pub mode: PortMode,

    /// Session self-cancellation after this many ms without byte movement
    /// in either direction. 0 disables the idle timeout.
    #[serde(default)]
    pub idle_timeout_ms: u32,

    /// Disabled ports keep their configuration but accept no clients.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Admission limit per port. RS-232 semantics: one client owns the
    /// line.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u8,
}

fn default_backlog() -> u16 {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> u8 {
    1
}

impl PortConfig {
    /// Structural validation against the platform pin range. Uniqueness
    /// across ports is the registry's job.
    pub fn validate(&self, max_pin: i16) -> Result<()> {
        if self.params.baud == 0 {
            return Err(GatewayError::invalid(format!(
                "port {}: baud rate must be nonzero",
                self.port_id
            )));
        }
        if !self.uart.pins_valid(max_pin) {
            return Err(GatewayError::invalid(format!(
                "port {}: pin assignment out of range (max {})",
                self.port_id, max_pin
            )));
        }
        if self.max_sessions == 0 {
            return Err(GatewayError::invalid(format!(
                "port {}: max_sessions must be at least 1",
                self.port_id
            )));
        }
        Ok(())
    }
}

// ── Control endpoint configuration ──────────────────────────────────────

/// Settings for the out-of-band admin endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub tcp_port: u16,
    #[serde(default = "default_control_backlog")]
    pub backlog: i32,
}

fn default_control_backlog() -> i32 {
    1
}

// ── Boot document ───────────────────────────────────────────────────────

/// The JSON configuration document loaded at startup. Persisted state,
/// when present and valid, takes precedence over the `ports` list here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    #[serde(default)]
    pub ports: Vec<PortConfig>,

    /// Control endpoint; absent disables it.
    #[serde(default)]
    pub control: Option<ControlConfig>,

    /// Directory backing the key/value store.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
}

fn default_store_dir() -> String {
    "data".to_string()
}

impl BootConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GatewayError::invalid(format!("boot config: {}", e)))
    }
}
