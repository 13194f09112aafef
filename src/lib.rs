//! # Portgate – serial-to-network gateway core
//!
//! Exposes UART links as TCP endpoints, optionally speaking the telnet
//! COM-port-control protocol (RFC 2217) so remote clients can reconfigure
//! framing and modem signals at runtime.
//!
//! - [`registry`] – the authoritative set of configured ports and live
//!   sessions; all mutation goes through it
//! - [`session`] – the per-client pump: socket ↔ codec ↔ UART, with idle
//!   timeout, back-pressure, and live reconfiguration
//! - [`control`] – the line-oriented admin endpoint
//! - [`persist`] – the key/value store and the versioned port snapshot
//! - [`config`] – port records and the JSON boot document
//!
//! The UART transport lives in the `portgate-serial` crate and the telnet
//! machinery in `portgate-telnet`.

pub mod config;
pub mod control;
pub mod error;
mod listener;
pub mod net;
pub mod persist;
pub mod registry;
pub mod session;

pub use config::{BootConfig, ControlConfig, PortConfig, PortMode};
pub use error::{ErrorKind, GatewayError};
pub use registry::{ChangeEvent, Registry};
pub use session::ActiveSessionView;
