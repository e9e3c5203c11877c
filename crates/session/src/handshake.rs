//! Handshake states, events and transition table

use hubvpn_fsm::{Event, Machine, MachineError, State};
use std::net::Ipv4Addr;
use std::sync::Weak;
use tracing::{debug, warn};

pub const AUTHENTICATION: State = State::new("Authentication");
pub const DOWNLOAD_CONFIG: State = State::new("DownloadConfig");
pub const COMMUNICATION: State = State::new("Communication");
pub const FAIL: State = State::new("Fail");

pub const AUTHENTICATE_SUCCESSFULLY: Event = Event::new("AuthenticateSuccessfully");
pub const DOWNLOAD_CONFIG_SUCCESSFULLY: Event = Event::new("DownloadConfigSuccessfully");
pub const SOMETHING_FAIL: Event = Event::new("SomethingFail");

/// Data carried by handshake events: the session's virtual address, once known
pub type SessionData = Option<Ipv4Addr>;

pub type SessionMachine = Machine<SessionData>;

/// Machine with the handshake transitions installed and no handlers.
///
/// Authentication -> DownloadConfig -> Communication, and every stage may
/// fall into Fail.
pub fn handshake_machine() -> SessionMachine {
    let machine = Machine::new();
    machine.add_transition(AUTHENTICATE_SUCCESSFULLY, AUTHENTICATION, DOWNLOAD_CONFIG);
    machine.add_transition(DOWNLOAD_CONFIG_SUCCESSFULLY, DOWNLOAD_CONFIG, COMMUNICATION);
    for stage in [AUTHENTICATION, DOWNLOAD_CONFIG, COMMUNICATION] {
        machine.add_transition(SOMETHING_FAIL, stage, FAIL);
    }
    machine
}

/// Trigger `event` on a machine held weakly by a stage callback.
///
/// Returns `Ok(false)` when the session has already been dropped.
pub fn fire(
    machine: &Weak<SessionMachine>,
    event: Event,
    data: SessionData,
) -> Result<bool, MachineError> {
    match machine.upgrade() {
        Some(machine) => {
            machine.trigger(event, data)?;
            Ok(true)
        }
        None => {
            debug!("Session gone, {} ignored", event);
            Ok(false)
        }
    }
}

/// Like `fire`, logging instead of returning the error
pub fn fire_logged(machine: &Weak<SessionMachine>, event: Event, data: SessionData) {
    if let Err(e) = fire(machine, event, data) {
        warn!("Handshake transition {} failed: {}", event, e);
    }
}
