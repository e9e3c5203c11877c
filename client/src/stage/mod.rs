//! Client side of the handshake

mod auth;
mod communication;
mod config;

use hubvpn_fsm::MachineError;
use hubvpn_protocol::{Authorization, Message};
use hubvpn_session::{AUTHENTICATION, SOMETHING_FAIL, SessionMachine, fire, handshake_machine};
use hubvpn_transport::Connection;
use hubvpn_tunnel::{DeviceOpener, TunnelDevice};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the client presents and how it opens its device
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub account: String,
    pub password: String,
    pub device_name: String,
    pub mtu: u16,
}

/// State shared by the client stages of one session
pub struct ClientContext {
    settings: ClientSettings,
    opener: Arc<dyn DeviceOpener>,
    authorization: Mutex<Option<Authorization>>,
    device: Mutex<Option<Arc<dyn TunnelDevice>>>,
    closed: watch::Sender<Option<String>>,
}

impl ClientContext {
    fn new(settings: ClientSettings, opener: Arc<dyn DeviceOpener>) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            settings,
            opener,
            authorization: Mutex::new(None),
            device: Mutex::new(None),
            closed,
        }
    }

    fn device(&self) -> Option<Arc<dyn TunnelDevice>> {
        self.device.lock().clone()
    }

    /// Record the end of the session and release the device.
    /// Only the first call has any effect.
    async fn finish(&self, reason: &str) {
        let first = self.closed.send_if_modified(|closed| {
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason.to_string());
            true
        });
        if !first {
            return;
        }

        let device = self.device.lock().take();
        if let Some(device) = device {
            if let Err(e) = device.close().await {
                warn!("Failed to close device: {}", e);
            }
        }
        info!("Session ended: {}", reason);
    }
}

/// Close callback shared by every client stage
async fn session_closed(ctx: &ClientContext, machine: &Weak<SessionMachine>, reason: String) {
    ctx.finish(&reason).await;
    if let Err(e) = fire(machine, SOMETHING_FAIL, None) {
        debug!("Failure transition skipped: {}", e);
    }
}

/// A `Fail` from the server ends the session
async fn server_failed(conn: &Connection, message: Message) {
    if let Message::Fail(fail) = message {
        warn!("Server rejected the session ({}): {}", fail.code, fail.message);
        conn.close(&format!("server failure {}: {}", fail.code, fail.message))
            .await;
    }
}

/// One client handshake session over a connection
pub struct ClientSession {
    machine: Arc<SessionMachine>,
    connection: Arc<Connection>,
    context: Arc<ClientContext>,
}

impl ClientSession {
    /// Build the handshake machine and enter Authentication, which sends the
    /// credentials as soon as the connection resumes
    pub fn start(
        connection: Arc<Connection>,
        settings: ClientSettings,
        opener: Arc<dyn DeviceOpener>,
    ) -> Result<Self, MachineError> {
        let context = Arc::new(ClientContext::new(settings, opener));
        let machine = Arc::new(handshake_machine());
        let weak = Arc::downgrade(&machine);

        machine.add_state_handler(auth::stage(&context, &connection, &weak));
        machine.add_state_handler(config::stage(&context, &connection, &weak));
        machine.add_state_handler(communication::stage(&context, &connection, &weak));

        machine.start(AUTHENTICATION, None)?;

        Ok(Self {
            machine,
            connection,
            context,
        })
    }

    /// Current handshake stage
    pub fn state(&self) -> Option<hubvpn_fsm::State> {
        self.machine.state()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Addresses granted by the server, once authorized
    pub fn authorization(&self) -> Option<Authorization> {
        self.context.authorization.lock().clone()
    }

    /// The local tunnel device, while the session is open
    pub fn device(&self) -> Option<Arc<dyn TunnelDevice>> {
        self.context.device()
    }

    /// Reason the session ended, if it has
    pub fn closed_reason(&self) -> Option<String> {
        self.context.closed.borrow().clone()
    }

    /// Resolve once the session has ended, with the reason
    pub async fn wait_closed(&self) -> String {
        let mut closed = self.context.closed.subscribe();
        match closed.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    pub async fn close(&self, reason: &str) {
        self.connection.close(reason).await;
    }
}
