//! Shared types for the UART transport crate.
//!
//! Covers framing parameters, the peripheral/pin binding, modem control
//! lines, latched line status, and the transport error type.

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Framing parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

impl Parity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Odd => "O",
            Self::Even => "E",
        }
    }

    /// Stored encoding: 0 = none, 1 = odd, 2 = even.
    pub fn value(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Odd => 1,
            Self::Even => 2,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Odd),
            2 => Some(Self::Even),
            _ => None,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        Self::One
    }
}

impl StopBits {
    pub fn label(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        }
    }

    /// Stored encoding: 1, 15 (= 1.5), 2.
    pub fn value(&self) -> u8 {
        match self {
            Self::One => 1,
            Self::OnePointFive => 15,
            Self::Two => 2,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::One),
            15 => Some(Self::OnePointFive),
            2 => Some(Self::Two),
            _ => None,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    /// Hardware flow control (RTS/CTS).
    RtsCts,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::None
    }
}

impl FlowControl {
    /// Stored encoding: 0 = none, 1 = RTS/CTS.
    pub fn value(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::RtsCts => 1,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::RtsCts),
            _ => None,
        }
    }
}

/// Complete framing configuration for a UART channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    /// Baud rate in bits per second.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Data bits per character.
    #[serde(default)]
    pub data_bits: DataBits,

    /// Parity mode.
    #[serde(default)]
    pub parity: Parity,

    /// Stop bits.
    #[serde(default)]
    pub stop_bits: StopBits,

    /// Flow control mode.
    #[serde(default)]
    pub flow_control: FlowControl,
}

fn default_baud() -> u32 {
    115200
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud: default_baud(),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
        }
    }
}

impl SerialParams {
    /// Shorthand notation (e.g. "115200-8N1").
    pub fn shorthand(&self) -> String {
        format!(
            "{}-{}{}{}",
            self.baud,
            self.data_bits.value(),
            self.parity.label(),
            self.stop_bits.label()
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Peripheral binding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sentinel pin value: line not connected / leave unchanged.
pub const PIN_UNUSED: i16 = -1;

/// Binding of a gateway port to a UART peripheral and its pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartBinding {
    /// Hardware UART peripheral number.
    pub uart_num: u8,

    /// Transmit pin.
    pub tx_pin: i16,

    /// Receive pin.
    pub rx_pin: i16,

    /// RTS pin ([`PIN_UNUSED`] when hardware flow control is not wired).
    #[serde(default = "unused_pin")]
    pub rts_pin: i16,

    /// CTS pin ([`PIN_UNUSED`] when hardware flow control is not wired).
    #[serde(default = "unused_pin")]
    pub cts_pin: i16,
}

fn unused_pin() -> i16 {
    PIN_UNUSED
}

impl UartBinding {
    /// Check all pins against the platform range. TX and RX must be wired;
    /// RTS and CTS may carry the unused sentinel.
    pub fn pins_valid(&self, max_pin: i16) -> bool {
        let in_range = |p: i16| (0..=max_pin).contains(&p);
        let optional = |p: i16| p == PIN_UNUSED || in_range(p);
        in_range(self.tx_pin)
            && in_range(self.rx_pin)
            && optional(self.rts_pin)
            && optional(self.cts_pin)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Modem control lines & line status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// RS-232 control line state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlLines {
    /// Data Terminal Ready (output).
    pub dtr: bool,
    /// Request To Send (output).
    pub rts: bool,
    /// Clear To Send (input).
    pub cts: bool,
    /// Data Set Ready (input).
    pub dsr: bool,
    /// Ring Indicator (input).
    pub ri: bool,
    /// Data Carrier Detect (input).
    pub dcd: bool,
}

/// Latched receive-side error conditions. Flags accumulate in the driver
/// and are cleared when read via [`crate::UartPort::take_line_status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStatus {
    pub break_detected: bool,
    pub overrun: bool,
    pub parity_error: bool,
    pub framing_error: bool,
}

impl LineStatus {
    pub fn any(&self) -> bool {
        self.break_detected || self.overrun || self.parity_error || self.framing_error
    }
}

/// Which driver buffer a purge targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeDirection {
    Receive,
    Transmit,
    Both,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error kinds surfaced by a UART transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UartErrorKind {
    /// The peripheral is already held by another channel.
    Busy,
    /// The requested framing or pin assignment cannot be applied.
    InvalidConfig,
    /// The channel is not open.
    NotOpen,
    /// Low-level transfer failure.
    Io,
}

/// Structured UART transport error.
#[derive(Debug, Clone)]
pub struct UartError {
    pub kind: UartErrorKind,
    pub message: String,
}

impl UartError {
    pub fn new(kind: UartErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn busy(uart_num: u8) -> Self {
        Self::new(UartErrorKind::Busy, format!("UART{} is already open", uart_num))
    }

    pub fn not_open() -> Self {
        Self::new(UartErrorKind::NotOpen, "channel is not open")
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(UartErrorKind::InvalidConfig, message)
    }
}

impl fmt::Display for UartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for UartError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_bits_roundtrip() {
        for v in [5, 6, 7, 8] {
            let db = DataBits::from_value(v).unwrap();
            assert_eq!(db.value(), v);
        }
        assert!(DataBits::from_value(4).is_none());
        assert!(DataBits::from_value(9).is_none());
    }

    #[test]
    fn parity_roundtrip() {
        for v in [0, 1, 2] {
            let p = Parity::from_value(v).unwrap();
            assert_eq!(p.value(), v);
        }
        assert!(Parity::from_value(3).is_none());
    }

    #[test]
    fn stop_bits_roundtrip() {
        for v in [1, 15, 2] {
            let s = StopBits::from_value(v).unwrap();
            assert_eq!(s.value(), v);
        }
        assert!(StopBits::from_value(3).is_none());
        assert_eq!(StopBits::OnePointFive.label(), "1.5");
    }

    #[test]
    fn flow_control_roundtrip() {
        assert_eq!(FlowControl::from_value(0), Some(FlowControl::None));
        assert_eq!(FlowControl::from_value(1), Some(FlowControl::RtsCts));
        assert!(FlowControl::from_value(2).is_none());
    }

    #[test]
    fn params_shorthand() {
        let p = SerialParams {
            baud: 115200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        };
        assert_eq!(p.shorthand(), "115200-8N1");
    }

    #[test]
    fn params_shorthand_7e2() {
        let p = SerialParams {
            baud: 19200,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            stop_bits: StopBits::Two,
            ..Default::default()
        };
        assert_eq!(p.shorthand(), "19200-7E2");
    }

    #[test]
    fn params_default_values() {
        let p = SerialParams::default();
        assert_eq!(p.baud, 115200);
        assert_eq!(p.data_bits, DataBits::Eight);
        assert_eq!(p.parity, Parity::None);
        assert_eq!(p.stop_bits, StopBits::One);
        assert_eq!(p.flow_control, FlowControl::None);
    }

    #[test]
    fn params_serde_roundtrip() {
        let p = SerialParams {
            baud: 38400,
            data_bits: DataBits::Seven,
            parity: Parity::Odd,
            stop_bits: StopBits::OnePointFive,
            flow_control: FlowControl::RtsCts,
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: SerialParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn params_deserialize_minimal() {
        let p: SerialParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p, SerialParams::default());
    }

    #[test]
    fn binding_pin_validation() {
        let mut b = UartBinding {
            uart_num: 1,
            tx_pin: 17,
            rx_pin: 16,
            rts_pin: PIN_UNUSED,
            cts_pin: PIN_UNUSED,
        };
        assert!(b.pins_valid(48));

        b.tx_pin = 49;
        assert!(!b.pins_valid(48));

        b.tx_pin = 17;
        b.rts_pin = 7;
        b.cts_pin = 8;
        assert!(b.pins_valid(48));

        b.rx_pin = PIN_UNUSED;
        assert!(!b.pins_valid(48), "RX must be wired");
    }

    #[test]
    fn line_status_any() {
        assert!(!LineStatus::default().any());
        let ls = LineStatus {
            overrun: true,
            ..Default::default()
        };
        assert!(ls.any());
    }

    #[test]
    fn uart_error_display() {
        let e = UartError::busy(1);
        assert!(e.to_string().contains("UART1"));
        assert_eq!(e.kind, UartErrorKind::Busy);
    }
}
