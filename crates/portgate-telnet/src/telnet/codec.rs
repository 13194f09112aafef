//! Telnet byte-stream codec.
//!
//! Parses the incoming TCP byte stream into [`TelnetFrame`]s. The parser
//! is a small automaton over {plain data, after IAC, after a negotiation
//! verb, inside a sub-negotiation, IAC inside a sub-negotiation}; state is
//! retained between calls so arbitrary TCP chunking is tolerated.
//!
//! Escaping rules: `0xFF 0xFF` on the wire produces a single `0xFF` data
//! byte; the egress direction uses [`crate::telnet::protocol::escape_iac`]
//! for the inverse.

use crate::telnet::protocol::{TelnetFrame, DO, DONT, IAC, SB, SE, WILL, WONT};
use crate::telnet::types::TelnetCommand;

/// Parser state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Plain data.
    Data,
    /// Just saw IAC, waiting for the verb byte.
    Command,
    /// Saw IAC + WILL/WONT/DO/DONT (or SB), waiting for the option byte.
    Option(u8),
    /// Inside a sub-negotiation payload.
    Subneg { option: u8, buf: Vec<u8> },
    /// Saw IAC inside a sub-negotiation payload.
    SubnegCommand { option: u8, buf: Vec<u8> },
}

/// Stateful telnet byte-stream parser.
#[derive(Debug)]
pub struct TelnetCodec {
    state: State,
    /// Accumulated data bytes, flushed when a command or the end of the
    /// input chunk is reached.
    data_buf: Vec<u8>,
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            data_buf: Vec::with_capacity(1024),
        }
    }

    /// Decode a chunk of bytes from the network into zero or more frames.
    pub fn decode(&mut self, input: &[u8]) -> Vec<TelnetFrame> {
        let mut frames = Vec::new();
        for &byte in input {
            self.step(byte, &mut frames);
        }
        self.flush_data(&mut frames);
        frames
    }

    fn step(&mut self, byte: u8, frames: &mut Vec<TelnetFrame>) {
        match std::mem::replace(&mut self.state, State::Data) {
            State::Data => {
                if byte == IAC {
                    self.flush_data(frames);
                    self.state = State::Command;
                } else {
                    self.data_buf.push(byte);
                }
            }
            State::Command => self.on_command_byte(byte, frames),
            State::Option(verb) => {
                if verb == SB {
                    self.state = State::Subneg {
                        option: byte,
                        buf: Vec::new(),
                    };
                } else {
                    // verb came out of the Command state, so it parses.
                    if let Some(command) = TelnetCommand::from_byte(verb) {
                        frames.push(TelnetFrame::Negotiation {
                            command,
                            option: byte,
                        });
                    }
                    self.state = State::Data;
                }
            }
            State::Subneg { option, mut buf } => {
                if byte == IAC {
                    self.state = State::SubnegCommand { option, buf };
                } else {
                    buf.push(byte);
                    self.state = State::Subneg { option, buf };
                }
            }
            State::SubnegCommand { option, mut buf } => match byte {
                SE => {
                    frames.push(TelnetFrame::SubNegotiation { option, data: buf });
                    self.state = State::Data;
                }
                IAC => {
                    // Escaped IAC inside the sub-negotiation payload.
                    buf.push(IAC);
                    self.state = State::Subneg { option, buf };
                }
                _ => {
                    // Malformed: IAC inside SB followed by something other
                    // than SE or IAC. Emit the payload collected so far and
                    // reprocess the byte as an ordinary post-IAC byte.
                    frames.push(TelnetFrame::SubNegotiation { option, data: buf });
                    self.on_command_byte(byte, frames);
                }
            },
        }
    }

    fn on_command_byte(&mut self, byte: u8, frames: &mut Vec<TelnetFrame>) {
        match byte {
            IAC => {
                // Escaped 0xFF → literal data byte.
                self.data_buf.push(IAC);
                self.state = State::Data;
            }
            WILL | WONT | DO | DONT | SB => {
                self.state = State::Option(byte);
            }
            _ => {
                if let Some(cmd) = TelnetCommand::from_byte(byte) {
                    frames.push(TelnetFrame::Command(cmd));
                }
                self.state = State::Data;
            }
        }
    }

    /// Push accumulated data bytes as a `Data` frame.
    fn flush_data(&mut self, frames: &mut Vec<TelnetFrame>) {
        if !self.data_buf.is_empty() {
            frames.push(TelnetFrame::Data(std::mem::take(&mut self.data_buf)));
        }
    }

    /// Reset to the initial state, discarding any partial sequence.
    pub fn reset(&mut self) {
        self.state = State::Data;
        self.data_buf.clear();
    }
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self::new()
    }
}
