//! RFC 1143 Q-method option negotiation state machine.
//!
//! Tracks per-option state for both sides of the connection and produces
//! the correct outgoing bytes for received WILL/WONT/DO/DONT commands
//! without ever entering a negotiation loop. The server-side session
//! registers the options it offers (WILL) and accepts (DO) at startup;
//! [`NegotiationManager::initial_negotiation`] then emits the opening
//! volley in registration order.

use std::collections::HashMap;

use crate::telnet::protocol::{self, DO, DONT, WILL, WONT};
use crate::telnet::types::{OptionState, QState, TelnetCommand};

/// Which side an option pertains to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local side (we WILL/WONT something).
    Local,
    /// The remote side (we DO/DONT something).
    Remote,
}

/// Manages option negotiation for all options on a connection.
#[derive(Debug, Default)]
pub struct NegotiationManager {
    /// Per-option state keyed by the raw option byte.
    options: HashMap<u8, OptionState>,
    /// Options we want active, in the order they should be requested at
    /// connection start. Local entries produce WILL, remote entries DO.
    startup: Vec<(Side, u8)>,
    /// Options we agree to enable locally if the remote asks, but never
    /// request ourselves.
    tolerated_local: Vec<u8>,
}

impl NegotiationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an option we want to enable locally (announced via WILL).
    pub fn offer_local(&mut self, option: u8) {
        if !self.startup.contains(&(Side::Local, option)) {
            self.startup.push((Side::Local, option));
        }
    }

    /// Register an option we want the remote to enable (requested via DO).
    pub fn request_remote(&mut self, option: u8) {
        if !self.startup.contains(&(Side::Remote, option)) {
            self.startup.push((Side::Remote, option));
        }
    }

    /// Register an option we accept DO for without requesting it at
    /// connection start.
    pub fn allow_local(&mut self, option: u8) {
        if !self.tolerated_local.contains(&option) {
            self.tolerated_local.push(option);
        }
    }

    fn state(&mut self, option: u8) -> &mut OptionState {
        self.options.entry(option).or_default()
    }

    fn wanted(&self, side: Side, option: u8) -> bool {
        self.startup.contains(&(side, option))
    }

    /// Is the option active on our side (we sent WILL, they agreed)?
    pub fn is_local_enabled(&self, option: u8) -> bool {
        self.options
            .get(&option)
            .map_or(false, |s| s.local == QState::Yes)
    }

    /// Is the option active on their side (they sent WILL, we agreed)?
    pub fn is_remote_enabled(&self, option: u8) -> bool {
        self.options
            .get(&option)
            .map_or(false, |s| s.remote == QState::Yes)
    }

    /// The opening volley: one WILL or DO per registered option, emitted
    /// in registration order. Idempotent — options already requested
    /// produce nothing on a second call.
    pub fn initial_negotiation(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for (side, opt) in self.startup.clone() {
            match side {
                Side::Local => {
                    let state = self.state(opt);
                    if state.local == QState::No {
                        state.local = QState::WantYes;
                        out.extend_from_slice(&protocol::build_negotiation(WILL, opt));
                    }
                }
                Side::Remote => {
                    let state = self.state(opt);
                    if state.remote == QState::No {
                        state.remote = QState::WantYes;
                        out.extend_from_slice(&protocol::build_negotiation(DO, opt));
                    }
                }
            }
        }
        out
    }

    /// Process a received negotiation command, returning the bytes to send
    /// in response (possibly empty). Non-negotiation commands are ignored.
    pub fn handle(&mut self, command: TelnetCommand, option: u8) -> Vec<u8> {
        match command {
            TelnetCommand::WILL => self.on_will(option),
            TelnetCommand::WONT => self.on_wont(option),
            TelnetCommand::DO => self.on_do(option),
            TelnetCommand::DONT => self.on_dont(option),
            _ => Vec::new(),
        }
    }

    fn on_will(&mut self, option: u8) -> Vec<u8> {
        let accepted = self.wanted(Side::Remote, option);
        let state = self.state(option);
        match state.remote {
            QState::No => {
                if accepted {
                    state.remote = QState::Yes;
                    protocol::build_negotiation(DO, option)
                } else {
                    protocol::build_negotiation(DONT, option)
                }
            }
            // Already enabled, or an expected answer to our DO.
            QState::Yes | QState::WantYes | QState::WantNoOpposite => {
                state.remote = QState::Yes;
                Vec::new()
            }
            QState::WantNo => {
                // DONT answered by WILL: RFC 1143 error recovery, drop to No.
                state.remote = QState::No;
                Vec::new()
            }
            QState::WantYesOpposite => {
                state.remote = QState::WantNo;
                protocol::build_negotiation(DONT, option)
            }
        }
    }

    fn on_wont(&mut self, option: u8) -> Vec<u8> {
        let state = self.state(option);
        match state.remote {
            QState::No | QState::WantNo | QState::WantYes | QState::WantYesOpposite => {
                state.remote = QState::No;
                Vec::new()
            }
            QState::Yes => {
                state.remote = QState::No;
                protocol::build_negotiation(DONT, option)
            }
            QState::WantNoOpposite => {
                state.remote = QState::WantYes;
                protocol::build_negotiation(DO, option)
            }
        }
    }

    fn on_do(&mut self, option: u8) -> Vec<u8> {
        let offered =
            self.wanted(Side::Local, option) || self.tolerated_local.contains(&option);
        let state = self.state(option);
        match state.local {
            QState::No => {
                if offered {
                    state.local = QState::Yes;
                    protocol::build_negotiation(WILL, option)
                } else {
                    protocol::build_negotiation(WONT, option)
                }
            }
            QState::Yes | QState::WantYes | QState::WantNoOpposite => {
                state.local = QState::Yes;
                Vec::new()
            }
            QState::WantNo => {
                // WONT answered by DO: error recovery.
                state.local = QState::No;
                Vec::new()
            }
            QState::WantYesOpposite => {
                state.local = QState::WantNo;
                protocol::build_negotiation(WONT, option)
            }
        }
    }

    fn on_dont(&mut self, option: u8) -> Vec<u8> {
        let state = self.state(option);
        match state.local {
            QState::No | QState::WantNo | QState::WantYes | QState::WantYesOpposite => {
                state.local = QState::No;
                Vec::new()
            }
            QState::Yes => {
                state.local = QState::No;
                protocol::build_negotiation(WONT, option)
            }
            QState::WantNoOpposite => {
                state.local = QState::WantYes;
                protocol::build_negotiation(WILL, option)
            }
        }
    }
}
