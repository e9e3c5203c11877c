//! Client configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Server to dial
    #[serde(default)]
    pub server: ServerConfig,

    /// Credentials presented during authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// TUN configuration
    #[serde(default)]
    pub tun: TunConfig,
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server address as `host:port`
    #[serde(default = "default_server_address")]
    pub address: String,
}

fn default_server_address() -> String {
    "127.0.0.1:9989".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

/// Credentials
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

/// TUN configuration
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.server.address, "127.0.0.1:9989");
        assert_eq!(config.auth.account, "admin");
        assert_eq!(config.tun.name, "hubvpn0");
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [server]
            address = "vpn.example.net:9989"

            [auth]
            account = "alice"
            password = "wonderland"

            [tun]
            mtu = 1380
            "#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).await.unwrap();
        assert_eq!(config.server.address, "vpn.example.net:9989");
        assert_eq!(config.auth.account, "alice");
        assert_eq!(config.auth.password, "wonderland");
        assert_eq!(config.tun.name, "hubvpn0");
        assert_eq!(config.tun.mtu, 1380);
    }
}
