//! hubvpn Session - Handshake stages
//!
//! A session is one `Connection` driven through the handshake machine.
//! Each stage owns a `StageHandler` that resumes the connection with its own
//! message callbacks on entry and suspends it on exit, so only one stage ever
//! dispatches at a time.

mod handshake;
mod stage;

pub use handshake::*;
pub use stage::*;
