//! Daemon configuration

use anyhow::Result;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Accepted credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Tunnel device configuration
    #[serde(default)]
    pub tun: TunConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9989))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Virtual network configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Address pool; the first host address belongs to the server
    #[serde(default = "default_cidr")]
    pub cidr: Ipv4Net,

    /// Static route list served to clients, one `address/prefix` per line
    #[serde(default)]
    pub routes_file: Option<PathBuf>,
}

fn default_cidr() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap_or_default()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
            routes_file: None,
        }
    }
}

/// Accepted credentials
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_account")]
    pub account: String,

    #[serde(default = "default_password")]
    pub password: String,
}

fn default_account() -> String {
    "admin".to_string()
}

fn default_password() -> String {
    "123456".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            password: default_password(),
        }
    }
}

/// Tunnel device configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TunConfig {
    /// Device name
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// MTU (Maximum Transmission Unit)
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_tun_name() -> String {
    "hubvpn0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            mtu: default_mtu(),
        }
    }
}
