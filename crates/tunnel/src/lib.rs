//! hubvpn Tunnel - Packet devices
//!
//! This crate provides:
//! - `TunnelDevice`: read/write one IP packet at a time plus route mutation
//! - `MemoryDevice`: channel-backed device for tests and embedding
//! - `TunDevice`: kernel TUN interface (Linux)
//! - IPv4 header helpers used for routing decisions

mod device;
mod memory;
pub mod packet;
mod tun_device;

pub use device::*;
pub use memory::*;
pub use tun_device::*;
