//! UART crate: sub-modules.

pub mod types;
pub mod transport;
