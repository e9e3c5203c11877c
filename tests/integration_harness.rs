//! Integration Test Harness
//!
//! Runs a daemon and any number of clients in one process. Sessions talk over
//! in-memory duplex streams and both sides use channel-backed tunnel devices.
#![allow(dead_code)]

use hubvpn_client::{ClientSession, ClientSettings};
use hubvpn_daemon::{Daemon, DaemonConfig};
use hubvpn_protocol::Converter;
use hubvpn_session::COMMUNICATION;
use hubvpn_transport::Connection;
use hubvpn_tunnel::{MemoryDevice, MemoryHandle, MemoryOpener};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Address clients believe they dialed
pub const SERVER_PEER: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
    9989,
);

/// How long a scenario may wait for the network to settle
pub const SETTLE: Duration = Duration::from_secs(5);

/// A daemon with its device's far side
pub struct TestNet {
    pub daemon: Daemon,
    pub device: MemoryHandle,
}

/// One connected client
pub struct TestClient {
    pub session: ClientSession,
    pub device: MemoryHandle,
    pub opener: Arc<MemoryOpener>,
    /// Address the daemon sees this client connecting from
    pub peer: SocketAddr,
}

impl TestNet {
    /// Start a daemon on `cidr` with default credentials
    pub async fn start(cidr: &str) -> Self {
        let mut config = DaemonConfig::default();
        config.network.cidr = cidr.parse().expect("cidr");
        Self::with_config(config).await
    }

    pub async fn with_config(config: DaemonConfig) -> Self {
        let (device, handle) = MemoryDevice::new();
        let daemon = Daemon::start(&config, &MemoryOpener::new(device))
            .await
            .expect("daemon start");
        Self {
            daemon,
            device: handle,
        }
    }

    /// Open a session from `port` with the given credentials
    pub async fn connect_as(&self, port: u16, account: &str, password: &str) -> TestClient {
        let (server_side, client_side) = tokio::io::duplex(256 * 1024);
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        self.daemon.registry().attach(server_side, peer).await;

        let connection = Connection::new(client_side, SERVER_PEER, Arc::new(Converter::standard()));
        let (device, handle) = MemoryDevice::new();
        let opener = Arc::new(MemoryOpener::new(device));
        let settings = ClientSettings {
            account: account.to_string(),
            password: password.to_string(),
            device_name: format!("hubvpn-test{}", port),
            mtu: 1500,
        };
        let session =
            ClientSession::start(connection, settings, opener.clone()).expect("client start");

        TestClient {
            session,
            device: handle,
            opener,
            peer,
        }
    }

    pub async fn connect(&self, port: u16) -> TestClient {
        self.connect_as(port, "admin", "123456").await
    }

    /// Connect and wait until both ends are in Communication
    pub async fn join(&self, port: u16) -> TestClient {
        let client = self.connect(port).await;
        let sessions = self.daemon.sessions();
        let router = self.daemon.context().router();

        let ready = wait_until(|| {
            let Some(address) = client.address() else {
                return false;
            };
            client.session.state() == Some(COMMUNICATION)
                && sessions.session_state(&client.peer) == Some(COMMUNICATION)
                && router.contains(address)
        })
        .await;
        assert!(ready, "client {} never reached communication", port);

        client
    }
}

impl TestClient {
    /// Virtual address leased to this client
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.session.authorization().map(|a| a.client_ip())
    }
}

/// Poll `condition` until it holds or `SETTLE` runs out
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    timeout(SETTLE, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// A UDP datagram inside an IPv4 packet
pub fn ipv4_packet(source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ipv4(source.octets(), destination.octets(), 64)
        .udp(40000, 40001);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut packet, payload).expect("packet");
    packet
}
