//! # Portgate – Telnet protocol engine
//!
//! Server-side telnet machinery for the gateway's TCP data ports:
//!
//! - **Protocol** – RFC 854 command bytes, frame types, and frame builders
//! - **Codec** – stateful IAC parser tolerant of arbitrary TCP chunking
//! - **Negotiation** – RFC 1143 Q-method option state machine
//! - **COM-port control** – RFC 2217 subnegotiation parsing, replies, and
//!   the mappings onto the UART framing types

pub mod telnet;

pub use telnet::codec::TelnetCodec;
pub use telnet::negotiation::NegotiationManager;
pub use telnet::protocol::TelnetFrame;
pub use telnet::types::{TelnetCommand, TelnetOption};
