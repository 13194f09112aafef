//! Low-level telnet protocol constants and frame types.
//!
//! Byte-level building blocks shared by the codec, negotiation, and
//! COM-port-control layers. Constants follow RFC 854 / 855.

use crate::telnet::types::TelnetCommand;

// ── Command byte constants ──────────────────────────────────────────────

/// The "Interpret As Command" escape byte (0xFF / 255).
pub const IAC: u8 = 255;
pub const SE: u8 = 240;
pub const SB: u8 = 250;
pub const WILL: u8 = 251;
pub const WONT: u8 = 252;
pub const DO: u8 = 253;
pub const DONT: u8 = 254;
pub const NOP: u8 = 241;
pub const BRK: u8 = 243;
pub const AYT: u8 = 246;
pub const GA: u8 = 249;

// ── Parsed telnet frame ─────────────────────────────────────────────────

/// A parsed unit from the telnet byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetFrame {
    /// Plain data bytes with all IAC escaping already undone.
    Data(Vec<u8>),

    /// A negotiation command: WILL, WONT, DO, DONT followed by an option byte.
    Negotiation { command: TelnetCommand, option: u8 },

    /// A sub-negotiation payload (everything between SB … SE, excluding
    /// the IAC SB header, the option byte, and the IAC SE trailer).
    SubNegotiation { option: u8, data: Vec<u8> },

    /// A simple IAC command (NOP, BRK, AYT, GA, …).
    Command(TelnetCommand),
}

// ── Frame builders ──────────────────────────────────────────────────────

/// Build a 3-byte IAC negotiation sequence.
pub fn build_negotiation(cmd: u8, option: u8) -> Vec<u8> {
    vec![IAC, cmd, option]
}

/// Build an IAC SB … IAC SE sub-negotiation frame.
/// `data` is the payload *after* the option byte.
pub fn build_subnegotiation(option: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + data.len());
    buf.push(IAC);
    buf.push(SB);
    buf.push(option);
    // IAC bytes inside sub-neg data must be escaped as IAC IAC.
    for &b in data {
        buf.push(b);
        if b == IAC {
            buf.push(IAC);
        }
    }
    buf.push(IAC);
    buf.push(SE);
    buf
}

/// Build a simple IAC command (e.g. IAC NOP, IAC BRK).
pub fn build_command(cmd: u8) -> Vec<u8> {
    vec![IAC, cmd]
}

/// Escape IAC bytes in data for transmission: a literal 0xFF in the data
/// stream goes out as 0xFF 0xFF.
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_negotiation_will_binary() {
        assert_eq!(build_negotiation(WILL, 0), vec![IAC, WILL, 0]);
    }

    #[test]
    fn build_negotiation_dont_sga() {
        assert_eq!(build_negotiation(DONT, 3), vec![IAC, DONT, 3]);
    }

    #[test]
    fn build_subneg_basic() {
        let frame = build_subnegotiation(44, &[1, 0, 0, 0x96, 0]);
        assert_eq!(frame, vec![IAC, SB, 44, 1, 0, 0, 0x96, 0, IAC, SE]);
    }

    #[test]
    fn build_subneg_escapes_iac_in_data() {
        let frame = build_subnegotiation(44, &[1, 255, 2]);
        assert_eq!(frame, vec![IAC, SB, 44, 1, 255, 255, 2, IAC, SE]);
    }

    #[test]
    fn build_command_brk() {
        assert_eq!(build_command(BRK), vec![IAC, BRK]);
    }

    #[test]
    fn escape_iac_no_iac() {
        assert_eq!(escape_iac(b"hello"), b"hello".to_vec());
    }

    #[test]
    fn escape_iac_doubles() {
        let input = [1, 255, 2, 255, 255, 3];
        assert_eq!(
            escape_iac(&input),
            vec![1, 255, 255, 2, 255, 255, 255, 255, 3]
        );
    }

    #[test]
    fn frame_equality() {
        let f1 = TelnetFrame::Data(vec![1, 2, 3]);
        let f2 = TelnetFrame::Data(vec![1, 2, 3]);
        assert_eq!(f1, f2);
        let c1 = TelnetFrame::Command(TelnetCommand::NOP);
        let c2 = TelnetFrame::Command(TelnetCommand::AreYouThere);
        assert_ne!(c1, c2);
    }
}
