//! hubvpn Protocol - Frame definitions and message serialization
//!
//! This crate defines the wire layer of a hubvpn session:
//! - `Frame`: a tagged, length-prefixed unit delimited by head/tail markers
//! - `Message`: the typed values carried by frames (authentication,
//!   configuration, tunnelled packets, failures)
//! - `Converter`: the registered tag table mapping frames to messages
//!
//! Structured payloads use rkyv; tunnelled packets travel as raw bytes.

mod converter;
mod frame;
mod message;

pub use converter::*;
pub use frame::*;
pub use message::*;
