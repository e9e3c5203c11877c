//! hubvpn Daemon
//!
//! The server side of the tunnel: accepts sessions, authenticates clients,
//! leases them virtual addresses and routes packets between their
//! connections and the shared tunnel device.

pub mod config;
pub mod ipam;
pub mod router;
pub mod routes;
pub mod stage;

use anyhow::Result;
use hubvpn_protocol::Converter;
use hubvpn_transport::{Registry, Server};
use hubvpn_tunnel::{DeviceConfig, DeviceOpener, TunOpener, TunnelDevice};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use config::DaemonConfig;
pub use ipam::{AddressPool, AllocError};
pub use router::{PacketSink, Router};
pub use routes::{RouteFileError, load_routes, parse_routes};
pub use stage::{Credentials, ServerContext, SessionManager, StageError};

/// A running daemon without its listener
pub struct Daemon {
    sessions: Arc<SessionManager>,
    registry: Arc<Registry>,
    device: Arc<dyn TunnelDevice>,
    router_task: JoinHandle<()>,
}

impl Daemon {
    /// Reserve the server address, open the device and start the router
    pub async fn start(config: &DaemonConfig, opener: &dyn DeviceOpener) -> Result<Self> {
        let pool = AddressPool::new(config.network.cidr)?;
        let server_address = pool.assign()?;
        let network = pool.network();

        let static_routes = match &config.network.routes_file {
            Some(path) => load_routes(path).await?,
            None => Vec::new(),
        };

        let device_config = DeviceConfig::new(&config.tun.name, server_address)
            .with_netmask(network.netmask())
            .with_mtu(config.tun.mtu);
        let device = opener.open(device_config).await?;
        device.add_route(network).await?;

        let router = Router::new(device.clone());
        let router_task = tokio::spawn(router.clone().run());

        let credentials = Credentials::new(&config.auth.account, &config.auth.password);
        let context = Arc::new(ServerContext::new(
            pool,
            server_address,
            &static_routes,
            credentials,
            router,
        ));
        let sessions = SessionManager::new(context);
        let registry = Registry::new(Arc::new(Converter::standard()), sessions.clone());

        info!(
            "Virtual network {} ready, server address {}, {} routes served",
            network,
            server_address,
            sessions.context().routes().len()
        );

        Ok(Self {
            sessions,
            registry,
            device,
            router_task,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        self.sessions.context()
    }

    /// Registry that owns accepted connections; streams attached here get a
    /// handshake session
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept TCP sessions on `bind` until the task is dropped
    pub async fn serve(&self, bind: SocketAddr) -> Result<()> {
        let server = Server::bind(bind, self.registry.clone()).await?;
        server.run().await?;
        Ok(())
    }

    /// Close the device and stop the router
    pub async fn shutdown(self) {
        if let Err(e) = self.device.close().await {
            warn!("Device close failed: {}", e);
        }
        if let Err(e) = self.router_task.await {
            warn!("Router task failed: {}", e);
        }
    }
}

/// Run the daemon with a kernel TUN device until interrupted
pub async fn run(config: DaemonConfig) -> Result<()> {
    let daemon = Daemon::start(&config, &TunOpener).await?;

    tokio::select! {
        result = daemon.serve(config.server.bind) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    daemon.shutdown().await;
    Ok(())
}
