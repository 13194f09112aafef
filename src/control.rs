//! Out-of-band control endpoint.
//!
//! A line-oriented TCP protocol for administration: ASCII commands, CRLF
//! terminated, one admin connection at a time. Every verb is a mechanical
//! translation onto a registry operation — validation lives in the
//! registry, never here. Responses are `OK` with optional `key=value`
//! pairs, or `ERR <reason>`.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use portgate_serial::{DataBits, FlowControl, Parity, StopBits};

use crate::config::{ControlConfig, PortMode};
use crate::net::Acceptor;
use crate::registry::Registry;

const HELP_LINE: &str = "OK verbs=LIST,SHOW,SET,DISCONNECT,HELP,QUIT";

/// Handle to a running control server.
pub struct ControlHandle {
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlHandle {
    /// The bound control port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Bind the control endpoint and start serving.
pub async fn start(registry: Arc<Registry>, cfg: &ControlConfig) -> io::Result<ControlHandle> {
    let backlog = cfg.backlog.clamp(1, u16::MAX as i32) as u16;
    let acceptor = Acceptor::bind(cfg.tcp_port, backlog).await?;
    let port = acceptor.port();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(serve(acceptor, registry, shutdown_rx));
    log::info!("[control] listening on tcp {}", port);
    Ok(ControlHandle {
        port,
        shutdown,
        task,
    })
}

async fn serve(acceptor: Acceptor, registry: Arc<Registry>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = acceptor.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::error!("[control] accept failed: {}", e);
                        break;
                    }
                };
                log::info!("[control] admin connected from {}", peer);
                // Single-admin: the next accept waits until this
                // connection finishes.
                if let Err(e) = handle_admin(stream, &registry).await {
                    log::debug!("[control] connection ended: {}", e);
                }
            }
        }
    }
    log::info!("[control] stopped");
}

async fn handle_admin(stream: TcpStream, registry: &Registry) -> io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (reply, quit) = dispatch(registry, line).await;
        wr.write_all(reply.as_bytes()).await?;
        wr.write_all(b"\r\n").await?;
        if quit {
            break;
        }
    }
    Ok(())
}

/// Translate one command line into a registry call. Returns the response
/// line and whether the connection should close.
async fn dispatch(registry: &Registry, line: &str) -> (String, bool) {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().unwrap_or("").to_ascii_uppercase();
    let rest: Vec<&str> = tokens.collect();

    let reply = match verb.as_str() {
        "LIST" => {
            let ports: Vec<String> = registry
                .copy_ports()
                .iter()
                .map(|p| p.tcp_port.to_string())
                .collect();
            format!("OK ports={}", ports.join(","))
        }
        "SHOW" => match parse_tcp_port(&rest) {
            Ok(tcp_port) => match registry.find_port(tcp_port) {
                Some(cfg) => format!(
                    "OK tcp_port={} port_id={} uart={} mode={} baud={} data_bits={} \
                     parity={} stop_bits={} flow={} idle_timeout_ms={} enabled={} sessions={}",
                    cfg.tcp_port,
                    cfg.port_id,
                    cfg.uart.uart_num,
                    cfg.mode.label(),
                    cfg.params.baud,
                    cfg.params.data_bits.value(),
                    match cfg.params.parity {
                        Parity::None => "none",
                        Parity::Odd => "odd",
                        Parity::Even => "even",
                    },
                    cfg.params.stop_bits.label(),
                    match cfg.params.flow_control {
                        FlowControl::None => "none",
                        FlowControl::RtsCts => "rts_cts",
                    },
                    cfg.idle_timeout_ms,
                    cfg.enabled,
                    registry
                        .list_sessions()
                        .iter()
                        .filter(|s| s.tcp_port == tcp_port)
                        .count(),
                ),
                None => format!("ERR no port on tcp {}", tcp_port),
            },
            Err(e) => e,
        },
        "SET" => match parse_tcp_port(&rest) {
            Ok(tcp_port) => run_set(registry, tcp_port, &rest[1..]).await,
            Err(e) => e,
        },
        "DISCONNECT" => match parse_tcp_port(&rest) {
            Ok(tcp_port) => {
                let existed = registry.disconnect_tcp_port(tcp_port);
                format!("OK disconnected={}", existed)
            }
            Err(e) => e,
        },
        "HELP" => HELP_LINE.to_string(),
        "QUIT" => return ("OK bye".to_string(), true),
        other => format!("ERR unknown command {}", other),
    };
    (reply, false)
}

fn parse_tcp_port(rest: &[&str]) -> Result<u16, String> {
    rest.first()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| "ERR expected a tcp port number".to_string())
}

/// Apply `key=value` assignments to a port. Framing/idle keys go through
/// `update_serial_config`; `mode`/`enabled` through `set_port_mode`.
async fn run_set(registry: &Registry, tcp_port: u16, pairs: &[&str]) -> String {
    let Some(cfg) = registry.find_port(tcp_port) else {
        return format!("ERR no port on tcp {}", tcp_port);
    };
    if pairs.is_empty() {
        return "ERR expected key=value assignments".to_string();
    }

    let mut params = cfg.params;
    let mut idle_timeout_ms = None;
    let mut mode = cfg.mode;
    let mut enabled = cfg.enabled;
    let mut apply_active = false;
    let mut framing_touched = false;
    let mut mode_touched = false;

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return format!("ERR malformed assignment {}", pair);
        };
        let ok = match key {
            "baud" => value
                .parse::<u32>()
                .map(|v| {
                    params.baud = v;
                    framing_touched = true;
                })
                .is_ok(),
            "data_bits" => value
                .parse::<u8>()
                .ok()
                .and_then(DataBits::from_value)
                .map(|v| {
                    params.data_bits = v;
                    framing_touched = true;
                })
                .is_some(),
            "parity" => match value {
                "none" => Some(Parity::None),
                "odd" => Some(Parity::Odd),
                "even" => Some(Parity::Even),
                _ => None,
            }
            .map(|v| {
                params.parity = v;
                framing_touched = true;
            })
            .is_some(),
            "stop_bits" => match value {
                "1" => Some(StopBits::One),
                "1.5" => Some(StopBits::OnePointFive),
                "2" => Some(StopBits::Two),
                _ => None,
            }
            .map(|v| {
                params.stop_bits = v;
                framing_touched = true;
            })
            .is_some(),
            "flow" => match value {
                "none" => Some(FlowControl::None),
                "rts_cts" => Some(FlowControl::RtsCts),
                _ => None,
            }
            .map(|v| {
                params.flow_control = v;
                framing_touched = true;
            })
            .is_some(),
            "idle_timeout_ms" => value
                .parse::<u32>()
                .map(|v| {
                    idle_timeout_ms = Some(v);
                    framing_touched = true;
                })
                .is_ok(),
            "mode" => PortMode::from_label(value)
                .map(|v| {
                    mode = v;
                    mode_touched = true;
                })
                .is_some(),
            "enabled" => value
                .parse::<bool>()
                .map(|v| {
                    enabled = v;
                    mode_touched = true;
                })
                .is_ok(),
            "apply" => value.parse::<bool>().map(|v| apply_active = v).is_ok(),
            _ => return format!("ERR unknown key {}", key),
        };
        if !ok {
            return format!("ERR bad value for {}", key);
        }
    }

    if framing_touched {
        if let Err(e) = registry
            .update_serial_config(tcp_port, params, idle_timeout_ms, apply_active, None)
            .await
        {
            return format!("ERR {}", e);
        }
    }
    if mode_touched {
        if let Err(e) = registry.set_port_mode(tcp_port, mode, enabled).await {
            return format!("ERR {}", e);
        }
    }
    format!("OK applied={}", pairs.join(","))
}
