//! Config stage: serve the route list

use super::ServerContext;
use hubvpn_protocol::{Config, MessageType};
use hubvpn_session::{
    DOWNLOAD_CONFIG, DOWNLOAD_CONFIG_SUCCESSFULLY, SessionData, SessionMachine, StageHandler,
    fire_logged,
};
use hubvpn_transport::Connection;
use std::sync::{Arc, Weak};
use tracing::debug;

pub(super) fn stage(
    context: &Arc<ServerContext>,
    connection: &Arc<Connection>,
    machine: &Weak<SessionMachine>,
) -> Arc<StageHandler<SessionData>> {
    let ctx = context.clone();
    let conn = connection.clone();
    let machine = machine.clone();
    let on_close_ctx = context.clone();
    let peer = connection.peer_addr();

    StageHandler::builder(DOWNLOAD_CONFIG, connection.clone())
        .on(MessageType::ConfigRequest, move |_| {
            let ctx = ctx.clone();
            let conn = conn.clone();
            let machine = machine.clone();
            async move {
                let Some(address) = ctx.lease_of(&peer) else {
                    conn.close("config requested without a lease").await;
                    return;
                };

                let config = Config {
                    routes: ctx.routes().to_vec(),
                };
                if let Err(e) = conn.send(&config.into()).await {
                    conn.close(&format!("failed to send config: {}", e)).await;
                    return;
                }

                debug!(%peer, "Served {} routes", ctx.routes().len());
                fire_logged(&machine, DOWNLOAD_CONFIG_SUCCESSFULLY, Some(address));
            }
        })
        .on_default(move |message| async move {
            debug!(%peer, "Ignoring {} while serving config", message.message_type());
        })
        .on_close(move |_reason| {
            let ctx = on_close_ctx.clone();
            async move {
                ctx.release(&peer);
            }
        })
        .build()
}
