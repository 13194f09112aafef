//! RFC 2217 COM-port-control subnegotiation layer.
//!
//! Parses client subnegotiation payloads into [`ComPortRequest`]s and
//! builds the server-coded replies (client subcommand + 100) carrying the
//! effective post-change values. Also holds the wire encodings for the
//! framing enums and the modem-state / line-state bit layouts used by the
//! NOTIFY subcommands.

use portgate_serial::{ControlLines, DataBits, FlowControl, LineStatus, Parity, StopBits};

use crate::telnet::protocol::build_subnegotiation;
use crate::telnet::types::TelnetOption;

// ── Subcommand codes (client side; server replies add 100) ──────────────

pub const SET_BAUDRATE: u8 = 1;
pub const SET_DATASIZE: u8 = 2;
pub const SET_PARITY: u8 = 3;
pub const SET_STOPSIZE: u8 = 4;
pub const SET_CONTROL: u8 = 5;
pub const NOTIFY_LINESTATE: u8 = 6;
pub const NOTIFY_MODEMSTATE: u8 = 7;
pub const FLOWCONTROL_SUSPEND: u8 = 8;
pub const FLOWCONTROL_RESUME: u8 = 9;
pub const SET_LINESTATE_MASK: u8 = 10;
pub const SET_MODEMSTATE_MASK: u8 = 11;
pub const PURGE_DATA: u8 = 12;

/// Offset added to a client subcommand to form the server reply code.
pub const SERVER_OFFSET: u8 = 100;

// ── SET-CONTROL subvalues ───────────────────────────────────────────────

pub const CONTROL_FLOW_REQUEST: u8 = 0;
pub const CONTROL_FLOW_NONE: u8 = 1;
pub const CONTROL_FLOW_XONXOFF: u8 = 2;
pub const CONTROL_FLOW_RTSCTS: u8 = 3;
pub const CONTROL_BREAK_REQUEST: u8 = 4;
pub const CONTROL_BREAK_ON: u8 = 5;
pub const CONTROL_BREAK_OFF: u8 = 6;
pub const CONTROL_DTR_REQUEST: u8 = 7;
pub const CONTROL_DTR_ON: u8 = 8;
pub const CONTROL_DTR_OFF: u8 = 9;
pub const CONTROL_RTS_REQUEST: u8 = 10;
pub const CONTROL_RTS_ON: u8 = 11;
pub const CONTROL_RTS_OFF: u8 = 12;

// ── PURGE-DATA subvalues ────────────────────────────────────────────────

pub const PURGE_RECEIVE: u8 = 1;
pub const PURGE_TRANSMIT: u8 = 2;
pub const PURGE_BOTH: u8 = 3;

// ── Modem-state byte (MSR layout) ───────────────────────────────────────

pub const MODEM_DELTA_CTS: u8 = 0x01;
pub const MODEM_DELTA_DSR: u8 = 0x02;
pub const MODEM_TRAILING_RI: u8 = 0x04;
pub const MODEM_DELTA_DCD: u8 = 0x08;
pub const MODEM_CTS: u8 = 0x10;
pub const MODEM_DSR: u8 = 0x20;
pub const MODEM_RI: u8 = 0x40;
pub const MODEM_DCD: u8 = 0x80;

// ── Line-state byte (LSR layout) ────────────────────────────────────────

pub const LINE_DATA_READY: u8 = 0x01;
pub const LINE_OVERRUN: u8 = 0x02;
pub const LINE_PARITY_ERROR: u8 = 0x04;
pub const LINE_FRAMING_ERROR: u8 = 0x08;
pub const LINE_BREAK: u8 = 0x10;

// ── Parsed client request ───────────────────────────────────────────────

/// A COM-port-control subnegotiation received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComPortRequest {
    /// 32-bit big-endian baud rate; 0 queries the current rate.
    SetBaudRate(u32),
    /// Data bits value; 0 queries.
    SetDataSize(u8),
    /// Parity wire code; 0 queries.
    SetParity(u8),
    /// Stop bits wire code; 0 queries.
    SetStopSize(u8),
    /// One of the `CONTROL_*` subvalues.
    SetControl(u8),
    /// Client-announced line state; informational.
    NotifyLineState(u8),
    /// Client-announced modem state; informational.
    NotifyModemState(u8),
    FlowSuspend,
    FlowResume,
    SetLineStateMask(u8),
    SetModemStateMask(u8),
    /// One of the `PURGE_*` subvalues.
    PurgeData(u8),
}

impl ComPortRequest {
    /// Parse a subnegotiation payload (subcommand byte + operands).
    /// Unknown subcommands and short payloads yield `None` and are dropped
    /// by the caller.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&sub, rest) = data.split_first()?;
        match sub {
            SET_BAUDRATE => {
                if rest.len() < 4 {
                    return None;
                }
                let baud = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                Some(Self::SetBaudRate(baud))
            }
            SET_DATASIZE => Some(Self::SetDataSize(*rest.first()?)),
            SET_PARITY => Some(Self::SetParity(*rest.first()?)),
            SET_STOPSIZE => Some(Self::SetStopSize(*rest.first()?)),
            SET_CONTROL => Some(Self::SetControl(*rest.first()?)),
            NOTIFY_LINESTATE => Some(Self::NotifyLineState(*rest.first()?)),
            NOTIFY_MODEMSTATE => Some(Self::NotifyModemState(*rest.first()?)),
            FLOWCONTROL_SUSPEND => Some(Self::FlowSuspend),
            FLOWCONTROL_RESUME => Some(Self::FlowResume),
            SET_LINESTATE_MASK => Some(Self::SetLineStateMask(*rest.first()?)),
            SET_MODEMSTATE_MASK => Some(Self::SetModemStateMask(*rest.first()?)),
            PURGE_DATA => Some(Self::PurgeData(*rest.first()?)),
            _ => None,
        }
    }
}

// ── Server reply builders ───────────────────────────────────────────────

fn comport_frame(data: &[u8]) -> Vec<u8> {
    build_subnegotiation(TelnetOption::ComPortControl.code(), data)
}

/// Server SET-BAUDRATE reply / notification with the effective rate.
pub fn reply_baud(baud: u32) -> Vec<u8> {
    let b = baud.to_be_bytes();
    comport_frame(&[SET_BAUDRATE + SERVER_OFFSET, b[0], b[1], b[2], b[3]])
}

/// Server single-byte reply for `subcommand` (client code, offset applied
/// here) carrying the effective value.
pub fn reply_byte(subcommand: u8, value: u8) -> Vec<u8> {
    comport_frame(&[subcommand + SERVER_OFFSET, value])
}

/// Server NOTIFY-LINESTATE with the masked line-state byte.
pub fn notify_linestate(state: u8) -> Vec<u8> {
    reply_byte(NOTIFY_LINESTATE, state)
}

/// Server NOTIFY-MODEMSTATE with the masked modem-state byte.
pub fn notify_modemstate(state: u8) -> Vec<u8> {
    reply_byte(NOTIFY_MODEMSTATE, state)
}

// ── Wire mappings onto the framing enums ────────────────────────────────

/// Parity wire code (RFC 2217: 1 none, 2 odd, 3 even).
pub fn parity_to_wire(p: Parity) -> u8 {
    match p {
        Parity::None => 1,
        Parity::Odd => 2,
        Parity::Even => 3,
    }
}

pub fn parity_from_wire(v: u8) -> Option<Parity> {
    match v {
        1 => Some(Parity::None),
        2 => Some(Parity::Odd),
        3 => Some(Parity::Even),
        _ => None,
    }
}

/// Stop-size wire code (RFC 2217: 1 one, 2 two, 3 one-and-a-half).
pub fn stop_bits_to_wire(s: StopBits) -> u8 {
    match s {
        StopBits::One => 1,
        StopBits::Two => 2,
        StopBits::OnePointFive => 3,
    }
}

pub fn stop_bits_from_wire(v: u8) -> Option<StopBits> {
    match v {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        3 => Some(StopBits::OnePointFive),
        _ => None,
    }
}

pub fn data_bits_to_wire(d: DataBits) -> u8 {
    d.value()
}

pub fn data_bits_from_wire(v: u8) -> Option<DataBits> {
    DataBits::from_value(v)
}

/// Flow-control wire code as used by SET-CONTROL (1 none, 3 RTS·CTS).
/// XON/XOFF is not supported by the gateway's UART layer.
pub fn flow_to_wire(f: FlowControl) -> u8 {
    match f {
        FlowControl::None => CONTROL_FLOW_NONE,
        FlowControl::RtsCts => CONTROL_FLOW_RTSCTS,
    }
}

pub fn flow_from_wire(v: u8) -> Option<FlowControl> {
    match v {
        CONTROL_FLOW_NONE => Some(FlowControl::None),
        CONTROL_FLOW_RTSCTS => Some(FlowControl::RtsCts),
        _ => None,
    }
}

// ── State byte builders ─────────────────────────────────────────────────

/// Compose the modem-state byte from the current lines, plus delta bits
/// relative to `previous` (a prior modem-state byte, high nibble used).
pub fn modemstate_byte(lines: &ControlLines, previous: u8) -> u8 {
    let mut state = 0u8;
    if lines.cts {
        state |= MODEM_CTS;
    }
    if lines.dsr {
        state |= MODEM_DSR;
    }
    if lines.ri {
        state |= MODEM_RI;
    }
    if lines.dcd {
        state |= MODEM_DCD;
    }

    let changed = (state ^ previous) & 0xF0;
    if changed & MODEM_CTS != 0 {
        state |= MODEM_DELTA_CTS;
    }
    if changed & MODEM_DSR != 0 {
        state |= MODEM_DELTA_DSR;
    }
    if changed & MODEM_RI != 0 {
        state |= MODEM_TRAILING_RI;
    }
    if changed & MODEM_DCD != 0 {
        state |= MODEM_DELTA_DCD;
    }
    state
}

/// Compose the line-state byte from latched receive-error flags.
pub fn linestate_byte(status: &LineStatus) -> u8 {
    let mut state = 0u8;
    if status.overrun {
        state |= LINE_OVERRUN;
    }
    if status.parity_error {
        state |= LINE_PARITY_ERROR;
    }
    if status.framing_error {
        state |= LINE_FRAMING_ERROR;
    }
    if status.break_detected {
        state |= LINE_BREAK;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telnet::protocol::{IAC, SB, SE};

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_set_baud() {
        let req = ComPortRequest::parse(&[SET_BAUDRATE, 0, 0, 0x96, 0]).unwrap();
        assert_eq!(req, ComPortRequest::SetBaudRate(38400));
    }

    #[test]
    fn parse_set_baud_query() {
        let req = ComPortRequest::parse(&[SET_BAUDRATE, 0, 0, 0, 0]).unwrap();
        assert_eq!(req, ComPortRequest::SetBaudRate(0));
    }

    #[test]
    fn parse_set_baud_short_payload() {
        assert!(ComPortRequest::parse(&[SET_BAUDRATE, 0, 0]).is_none());
    }

    #[test]
    fn parse_single_byte_subcommands() {
        assert_eq!(
            ComPortRequest::parse(&[SET_DATASIZE, 8]),
            Some(ComPortRequest::SetDataSize(8))
        );
        assert_eq!(
            ComPortRequest::parse(&[SET_PARITY, 3]),
            Some(ComPortRequest::SetParity(3))
        );
        assert_eq!(
            ComPortRequest::parse(&[SET_STOPSIZE, 1]),
            Some(ComPortRequest::SetStopSize(1))
        );
        assert_eq!(
            ComPortRequest::parse(&[SET_CONTROL, CONTROL_DTR_ON]),
            Some(ComPortRequest::SetControl(CONTROL_DTR_ON))
        );
        assert_eq!(
            ComPortRequest::parse(&[PURGE_DATA, PURGE_BOTH]),
            Some(ComPortRequest::PurgeData(PURGE_BOTH))
        );
        assert_eq!(
            ComPortRequest::parse(&[SET_MODEMSTATE_MASK, 0xF0]),
            Some(ComPortRequest::SetModemStateMask(0xF0))
        );
    }

    #[test]
    fn parse_flow_suspend_resume() {
        assert_eq!(
            ComPortRequest::parse(&[FLOWCONTROL_SUSPEND]),
            Some(ComPortRequest::FlowSuspend)
        );
        assert_eq!(
            ComPortRequest::parse(&[FLOWCONTROL_RESUME]),
            Some(ComPortRequest::FlowResume)
        );
    }

    #[test]
    fn parse_unknown_subcommand() {
        assert!(ComPortRequest::parse(&[0, 1, 2]).is_none());
        assert!(ComPortRequest::parse(&[99, 1]).is_none());
        assert!(ComPortRequest::parse(&[]).is_none());
    }

    #[test]
    fn parse_missing_operand() {
        assert!(ComPortRequest::parse(&[SET_DATASIZE]).is_none());
        assert!(ComPortRequest::parse(&[SET_CONTROL]).is_none());
    }

    // ── Reply builders ──────────────────────────────────────────────

    #[test]
    fn reply_baud_frame() {
        // 38400 → IAC SB 44 101 00 00 96 00 IAC SE
        assert_eq!(
            reply_baud(38400),
            vec![IAC, SB, 44, 101, 0x00, 0x00, 0x96, 0x00, IAC, SE]
        );
    }

    #[test]
    fn reply_byte_applies_offset() {
        assert_eq!(
            reply_byte(SET_DATASIZE, 8),
            vec![IAC, SB, 44, 102, 8, IAC, SE]
        );
        assert_eq!(
            reply_byte(SET_CONTROL, CONTROL_DTR_ON),
            vec![IAC, SB, 44, 105, 8, IAC, SE]
        );
    }

    #[test]
    fn notify_builders() {
        assert_eq!(
            notify_modemstate(MODEM_CTS | MODEM_DELTA_CTS),
            vec![IAC, SB, 44, 107, 0x11, IAC, SE]
        );
        assert_eq!(
            notify_linestate(LINE_BREAK),
            vec![IAC, SB, 44, 106, 0x10, IAC, SE]
        );
    }

    // ── Wire mappings ───────────────────────────────────────────────

    #[test]
    fn parity_wire_roundtrip() {
        for p in [Parity::None, Parity::Odd, Parity::Even] {
            assert_eq!(parity_from_wire(parity_to_wire(p)), Some(p));
        }
        assert!(parity_from_wire(0).is_none());
        assert!(parity_from_wire(4).is_none(), "mark parity unsupported");
    }

    #[test]
    fn stop_bits_wire_roundtrip() {
        for s in [StopBits::One, StopBits::Two, StopBits::OnePointFive] {
            assert_eq!(stop_bits_from_wire(stop_bits_to_wire(s)), Some(s));
        }
        assert!(stop_bits_from_wire(0).is_none());
    }

    #[test]
    fn flow_wire_roundtrip() {
        assert_eq!(flow_to_wire(FlowControl::None), 1);
        assert_eq!(flow_to_wire(FlowControl::RtsCts), 3);
        assert_eq!(flow_from_wire(1), Some(FlowControl::None));
        assert_eq!(flow_from_wire(3), Some(FlowControl::RtsCts));
        assert!(flow_from_wire(CONTROL_FLOW_XONXOFF).is_none());
    }

    // ── State bytes ─────────────────────────────────────────────────

    #[test]
    fn modemstate_current_bits() {
        let lines = ControlLines {
            cts: true,
            dsr: true,
            ..Default::default()
        };
        let state = modemstate_byte(&lines, MODEM_CTS | MODEM_DSR);
        assert_eq!(state, MODEM_CTS | MODEM_DSR, "no deltas when unchanged");
    }

    #[test]
    fn modemstate_delta_bits() {
        let lines = ControlLines {
            cts: true,
            dcd: true,
            ..Default::default()
        };
        // Previously DSR was up, CTS/DCD were down.
        let state = modemstate_byte(&lines, MODEM_DSR);
        assert_eq!(
            state,
            MODEM_CTS | MODEM_DCD | MODEM_DELTA_CTS | MODEM_DELTA_DSR | MODEM_DELTA_DCD
        );
    }

    #[test]
    fn linestate_bits() {
        let status = LineStatus {
            break_detected: true,
            framing_error: true,
            ..Default::default()
        };
        assert_eq!(linestate_byte(&status), LINE_BREAK | LINE_FRAMING_ERROR);
        assert_eq!(linestate_byte(&LineStatus::default()), 0);
    }
}
