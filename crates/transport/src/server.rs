//! TCP server and the table of live connections

use crate::connection::Connection;
use async_trait::async_trait;
use dashmap::DashMap;
use hubvpn_protocol::Converter;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),
}

/// Lifecycle callbacks for connections owned by a registry
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// A connection was accepted and registered
    async fn accepted(&self, connection: Arc<Connection>);

    /// A registered connection closed and was removed
    async fn closed(&self, connection: Arc<Connection>, reason: &str);
}

/// Live connections keyed by peer address
pub struct Registry {
    connections: DashMap<SocketAddr, Arc<Connection>>,
    converter: Arc<Converter>,
    handler: Arc<dyn ServerHandler>,
}

impl Registry {
    pub fn new(converter: Arc<Converter>, handler: Arc<dyn ServerHandler>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            converter,
            handler,
        })
    }

    /// Wrap an accepted stream, register it and notify the handler
    pub async fn attach<S>(self: &Arc<Self>, stream: S, peer: SocketAddr) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let connection = Connection::new(stream, peer, self.converter.clone());
        connection.attach_registry(Arc::downgrade(self));

        if let Some(old) = self.connections.insert(peer, connection.clone()) {
            warn!("Replacing live connection from {}", peer);
            old.close("replaced").await;
        }

        debug!("Registered connection from {}", peer);
        self.handler.accepted(connection.clone()).await;

        connection
    }

    pub(crate) async fn deregister(&self, connection: &Connection, reason: &str) {
        let peer = connection.peer_addr();
        let removed = self
            .connections
            .remove_if(&peer, |_, live| std::ptr::eq(live.as_ref(), connection));
        if let Some((_, connection)) = removed {
            debug!("Deregistered connection from {}", peer);
            self.handler.closed(connection, reason).await;
        }
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.get(peer).map(|c| c.value().clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close the connection from `peer`, if any
    pub async fn disconnect(&self, peer: &SocketAddr, reason: &str) -> bool {
        match self.get(peer) {
            Some(connection) => {
                connection.close(reason).await;
                true
            }
            None => false,
        }
    }
}

/// Listening server feeding accepted sockets into a registry
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    /// Listen on `addr`, registering accepted connections in `registry`
    pub async fn bind(addr: SocketAddr, registry: Arc<Registry>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(e.to_string()))?;

        info!("Server listening on {}", addr);

        Ok(Self { listener, registry })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("{}", ServerError::AcceptFailed(e.to_string()));
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer, e);
            }

            info!("Accepted connection from {}", peer);
            let registry = self.registry.clone();
            tokio::spawn(async move {
                registry.attach(stream, peer).await;
            });
        }
    }
}
