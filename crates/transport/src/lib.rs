//! hubvpn Transport - Session connections
//!
//! This crate provides:
//! - `Connection`: one framed session over a byte stream, with an exclusive
//!   read loop that can be suspended and resumed with a different handler
//! - `Server` / `Registry`: TCP accept loop and the peer-keyed table of live
//!   connections

mod connection;
mod server;

pub use connection::*;
pub use server::*;
