//! Telnet types: command and option descriptors, negotiation state.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── RFC 854 command bytes ───────────────────────────────────────────────

/// Telnet protocol command bytes (RFC 854).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TelnetCommand {
    /// Sub-negotiation End
    SE = 240,
    /// No Operation
    NOP = 241,
    /// Data Mark
    DataMark = 242,
    /// Break
    Break = 243,
    /// Interrupt Process
    InterruptProcess = 244,
    /// Abort Output
    AbortOutput = 245,
    /// Are You There
    AreYouThere = 246,
    /// Erase Character
    EraseCharacter = 247,
    /// Erase Line
    EraseLine = 248,
    /// Go Ahead
    GoAhead = 249,
    /// Sub-negotiation Begin
    SB = 250,
    /// WILL (sender wants to enable option)
    WILL = 251,
    /// WON'T (sender refuses to enable option)
    WONT = 252,
    /// DO (sender wants receiver to enable option)
    DO = 253,
    /// DON'T (sender wants receiver to disable option)
    DONT = 254,
    /// Interpret As Command (escape byte)
    IAC = 255,
}

impl TelnetCommand {
    /// Try to convert a raw byte into a `TelnetCommand`.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            240 => Some(Self::SE),
            241 => Some(Self::NOP),
            242 => Some(Self::DataMark),
            243 => Some(Self::Break),
            244 => Some(Self::InterruptProcess),
            245 => Some(Self::AbortOutput),
            246 => Some(Self::AreYouThere),
            247 => Some(Self::EraseCharacter),
            248 => Some(Self::EraseLine),
            249 => Some(Self::GoAhead),
            250 => Some(Self::SB),
            251 => Some(Self::WILL),
            252 => Some(Self::WONT),
            253 => Some(Self::DO),
            254 => Some(Self::DONT),
            255 => Some(Self::IAC),
            _ => None,
        }
    }
}

impl fmt::Display for TelnetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ── Options the gateway negotiates ──────────────────────────────────────

/// Telnet option codes relevant to a COM-port server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TelnetOption {
    /// Binary Transmission (RFC 856)
    BinaryTransmission = 0,
    /// Echo (RFC 857)
    Echo = 1,
    /// Suppress Go Ahead (RFC 858)
    SuppressGoAhead = 3,
    /// Status (RFC 859)
    Status = 5,
    /// Timing Mark (RFC 860)
    TimingMark = 6,
    /// COM Port Control (RFC 2217)
    ComPortControl = 44,
}

impl TelnetOption {
    /// Try to convert a raw byte into a known `TelnetOption`.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::BinaryTransmission),
            1 => Some(Self::Echo),
            3 => Some(Self::SuppressGoAhead),
            5 => Some(Self::Status),
            6 => Some(Self::TimingMark),
            44 => Some(Self::ComPortControl),
            _ => None,
        }
    }

    /// Option code byte.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TelnetOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u8)
    }
}

// ── Negotiation Q-method state (RFC 1143) ───────────────────────────────

/// Per-option negotiation state for one side (local or remote).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QState {
    #[default]
    No,
    Yes,
    WantNo,
    WantYes,
    /// WantNo with a queued opposite request.
    WantNoOpposite,
    /// WantYes with a queued opposite request.
    WantYesOpposite,
}

/// Tracks the state of a single telnet option for both the local and
/// remote side using the RFC 1143 Q-method.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionState {
    /// What the local side is doing (WILL/WONT perspective).
    pub local: QState,
    /// What the remote side is doing (DO/DONT perspective).
    pub remote: QState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_from_byte_roundtrip() {
        for b in 240..=255 {
            let cmd = TelnetCommand::from_byte(b).unwrap();
            assert_eq!(cmd as u8, b);
        }
    }

    #[test]
    fn command_from_byte_invalid() {
        assert!(TelnetCommand::from_byte(0).is_none());
        assert!(TelnetCommand::from_byte(44).is_none());
        assert!(TelnetCommand::from_byte(239).is_none());
    }

    #[test]
    fn option_from_byte_known() {
        assert_eq!(TelnetOption::from_byte(0), Some(TelnetOption::BinaryTransmission));
        assert_eq!(TelnetOption::from_byte(1), Some(TelnetOption::Echo));
        assert_eq!(TelnetOption::from_byte(3), Some(TelnetOption::SuppressGoAhead));
        assert_eq!(TelnetOption::from_byte(44), Some(TelnetOption::ComPortControl));
    }

    #[test]
    fn option_from_byte_unknown() {
        assert!(TelnetOption::from_byte(24).is_none());
        assert!(TelnetOption::from_byte(99).is_none());
    }

    #[test]
    fn option_code() {
        assert_eq!(TelnetOption::BinaryTransmission.code(), 0);
        assert_eq!(TelnetOption::ComPortControl.code(), 44);
    }

    #[test]
    fn option_display() {
        let s = format!("{}", TelnetOption::ComPortControl);
        assert!(s.contains("ComPortControl"));
        assert!(s.contains("44"));
    }

    #[test]
    fn qstate_default_is_no() {
        assert_eq!(QState::default(), QState::No);
        let os = OptionState::default();
        assert_eq!(os.local, QState::No);
        assert_eq!(os.remote, QState::No);
    }
}
