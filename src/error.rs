//! Gateway error type.
//!
//! Every registry operation returns a tagged result; session-local
//! failures are logged and end the session without propagating.

use portgate_serial::{UartError, UartErrorKind};
use std::fmt;

/// Error kinds surfaced by the gateway core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad pin, duplicate identity, unknown UART; nothing changed.
    ConfigInvalid,
    /// A port with that identity is already configured.
    AlreadyExists,
    /// No port with that identity is configured.
    NotFound,
    /// Exclusive UART access is held by another session.
    PortBusy,
    /// The operation needs the port quiescent (e.g. pin overrides with a
    /// session running).
    Conflict,
    /// The UART or socket refused to initialise.
    IoFatal,
    Internal,
}

/// Structured gateway error.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn not_found(tcp_port: u16) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("no port configured on tcp {}", tcp_port),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn io_fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoFatal, message)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for GatewayError {}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::io_fatal(e.to_string())
    }
}

impl From<UartError> for GatewayError {
    fn from(e: UartError) -> Self {
        let kind = match e.kind {
            UartErrorKind::Busy => ErrorKind::PortBusy,
            UartErrorKind::InvalidConfig => ErrorKind::ConfigInvalid,
            UartErrorKind::NotOpen | UartErrorKind::Io => ErrorKind::IoFatal,
        };
        Self::new(kind, e.message)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
