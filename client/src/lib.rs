//! hubvpn Client Library
//!
//! Dials the daemon, walks the handshake and then pumps packets between the
//! local TUN device and the tunnel connection.

pub mod config;
pub mod stage;

use anyhow::Result;
use hubvpn_protocol::Converter;
use hubvpn_transport::Connection;
use hubvpn_tunnel::TunOpener;
use std::sync::Arc;
use tracing::info;

pub use config::ClientConfig;
pub use stage::{ClientSession, ClientSettings};

impl From<&ClientConfig> for ClientSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            account: config.auth.account.clone(),
            password: config.auth.password.clone(),
            device_name: config.tun.name.clone(),
            mtu: config.tun.mtu,
        }
    }
}

/// Connect to the configured server and stay in the session until it ends
/// or the process is interrupted
pub async fn run(config: ClientConfig) -> Result<()> {
    let converter = Arc::new(Converter::standard());
    let connection = Connection::connect(config.server.address.as_str(), converter).await?;

    let settings = ClientSettings::from(&config);
    let session = ClientSession::start(connection, settings, Arc::new(TunOpener))?;

    tokio::select! {
        reason = session.wait_closed() => {
            anyhow::bail!("session closed: {}", reason);
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted, disconnecting"),
    }

    session.close("client shutdown").await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = ClientConfig::default();
        config.auth.account = "bob".to_string();
        config.tun.mtu = 1400;

        let settings = ClientSettings::from(&config);
        assert_eq!(settings.account, "bob");
        assert_eq!(settings.password, "123456");
        assert_eq!(settings.device_name, "hubvpn0");
        assert_eq!(settings.mtu, 1400);
    }
}
