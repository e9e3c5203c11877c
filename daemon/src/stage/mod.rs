//! Server side of the handshake
//!
//! `ServerContext` holds what every session shares: the address pool, the
//! router, the served route list and the accepted credentials.
//! `SessionManager` builds one handshake machine per accepted connection
//! and tears it down when the connection closes.

mod auth;
mod communication;
mod config;

use crate::ipam::{AddressPool, AllocError};
use crate::router::Router;
use async_trait::async_trait;
use dashmap::DashMap;
use hubvpn_fsm::State;
use hubvpn_protocol::{Authentication, Route};
use hubvpn_session::{AUTHENTICATION, SessionMachine, handshake_machine};
use hubvpn_transport::{Connection, ServerHandler};
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0} entered without an assigned address")]
    MissingAddress(State),

    #[error("Lease on {0} was released before the stage started")]
    LeaseReleased(Ipv4Addr),
}

/// Account accepted by the authentication stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account: String,
    pub password: String,
}

impl Credentials {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
        }
    }

    fn matches(&self, auth: &Authentication) -> bool {
        self.account == auth.account && self.password == auth.password
    }
}

/// State shared by all server sessions
pub struct ServerContext {
    pool: AddressPool,
    server_address: Ipv4Addr,
    routes: Vec<Route>,
    credentials: Credentials,
    router: Arc<Router>,
    /// Address held by each authenticated peer
    leases: DashMap<SocketAddr, Ipv4Addr>,
}

impl ServerContext {
    /// `server_address` must already be assigned from `pool`. The served
    /// route list is the server's host route followed by `static_routes`.
    pub fn new(
        pool: AddressPool,
        server_address: Ipv4Addr,
        static_routes: &[Ipv4Net],
        credentials: Credentials,
        router: Arc<Router>,
    ) -> Self {
        let routes = std::iter::once(Route::host(server_address))
            .chain(static_routes.iter().copied().map(Route::from))
            .collect();

        Self {
            pool,
            server_address,
            routes,
            credentials,
            router,
            leases: DashMap::new(),
        }
    }

    pub fn server_address(&self) -> Ipv4Addr {
        self.server_address
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn lease_of(&self, peer: &SocketAddr) -> Option<Ipv4Addr> {
        self.leases.get(peer).map(|lease| *lease.value())
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    fn authorize(&self, auth: &Authentication) -> bool {
        self.credentials.matches(auth)
    }

    /// Assign an address to `peer`
    fn lease(&self, peer: SocketAddr) -> Result<Ipv4Addr, AllocError> {
        let address = self.pool.assign()?;
        if let Some(previous) = self.leases.insert(peer, address) {
            warn!(%peer, "Peer re-authenticated, retiring {}", previous);
            self.router.unregister(previous);
            self.pool.retire(previous);
        }
        Ok(address)
    }

    /// Drop the router entry of `peer` and return its address to the pool.
    /// Only the first call per lease has any effect.
    pub fn release(&self, peer: &SocketAddr) -> Option<Ipv4Addr> {
        let (_, address) = self.leases.remove(peer)?;
        self.router.unregister(address);
        self.pool.retire(address);
        info!(%peer, %address, "Address released");
        Some(address)
    }
}

/// Builds and owns the handshake machine of every live connection
pub struct SessionManager {
    context: Arc<ServerContext>,
    sessions: DashMap<SocketAddr, Arc<SessionMachine>>,
}

impl SessionManager {
    pub fn new(context: Arc<ServerContext>) -> Arc<Self> {
        Arc::new(Self {
            context,
            sessions: DashMap::new(),
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handshake stage of the session from `peer`
    pub fn session_state(&self, peer: &SocketAddr) -> Option<State> {
        self.sessions.get(peer).and_then(|machine| machine.state())
    }

    fn build_machine(&self, connection: &Arc<Connection>) -> Arc<SessionMachine> {
        let machine = Arc::new(handshake_machine());
        let weak = Arc::downgrade(&machine);

        machine.add_state_handler(auth::stage(&self.context, connection, &weak));
        machine.add_state_handler(config::stage(&self.context, connection, &weak));
        machine.add_state_handler(communication::stage(&self.context, connection));

        machine
    }
}

#[async_trait]
impl ServerHandler for SessionManager {
    async fn accepted(&self, connection: Arc<Connection>) {
        let peer = connection.peer_addr();
        let machine = self.build_machine(&connection);
        self.sessions.insert(peer, machine.clone());

        if let Err(e) = machine.start(AUTHENTICATION, None) {
            warn!(%peer, "Session failed to start: {}", e);
            connection.close(&e.to_string()).await;
            return;
        }
        debug!(%peer, "Session started");
    }

    async fn closed(&self, connection: Arc<Connection>, reason: &str) {
        let peer = connection.peer_addr();
        self.context.release(&peer);
        let state = self
            .sessions
            .remove(&peer)
            .and_then(|(_, machine)| machine.state());

        info!(
            %peer,
            stage = state.map(|s| s.name()).unwrap_or("-"),
            "Session ended: {}",
            reason
        );
    }
}
