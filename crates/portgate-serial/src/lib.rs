//! # Portgate – UART transport
//!
//! Hardware-facing half of the gateway:
//!
//! - **Framing parameters** – baud rate, data bits, parity, stop bits, and
//!   flow control, with the wire encodings used by persistence and
//!   COM-port-control
//! - **UART binding** – peripheral number and pin assignment for a port
//! - **Transport** – the async [`uart::UartPort`] / [`uart::UartDriver`]
//!   traits a platform back-end implements
//! - **Simulated port** – a fully in-memory implementation with RX/TX
//!   injection and control-line manipulation, used by tests and host builds

pub mod uart;

pub use uart::transport::{SimulatedUart, SimulatedUartDriver, UartDriver, UartPort};
pub use uart::types::*;
