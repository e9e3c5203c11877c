//! Tunnel device collaborator interface

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

/// Largest packet a device read may return
pub const MAX_PACKET_SIZE: usize = 65535;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device closed")]
    Closed,

    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Route error: {0}")]
    Route(String),

    #[error("Packet of {packet} bytes does not fit a {buffer} byte buffer")]
    PacketTooLarge { packet: usize, buffer: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local packet interface through which tunnel traffic enters and leaves
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Read exactly one IP packet into `buf`
    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError>;

    /// Write one IP packet
    async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError>;

    /// Route `net` through this device
    async fn add_route(&self, net: Ipv4Net) -> Result<(), DeviceError>;

    /// Close the device, removing routes added through it
    async fn close(&self) -> Result<(), DeviceError>;
}

/// Parameters for opening a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Interface name (e.g., "hubvpn0")
    pub name: String,

    /// Local virtual address
    pub address: Ipv4Addr,

    /// Point-to-point peer address
    pub destination: Option<Ipv4Addr>,

    /// Netmask of the local address
    pub netmask: Ipv4Addr,

    pub mtu: u16,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            address,
            destination: None,
            netmask: Ipv4Addr::new(255, 255, 255, 255),
            mtu: 1500,
        }
    }

    pub fn with_destination(mut self, destination: Ipv4Addr) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = netmask;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Factory for devices opened once addresses are known
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    async fn open(&self, config: DeviceConfig) -> Result<Arc<dyn TunnelDevice>, DeviceError>;
}
