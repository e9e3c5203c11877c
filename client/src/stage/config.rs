//! Config stage: request and install routes

use super::{ClientContext, server_failed, session_closed};
use hubvpn_protocol::{Message, MessageType};
use hubvpn_session::{
    DOWNLOAD_CONFIG, DOWNLOAD_CONFIG_SUCCESSFULLY, SessionData, SessionMachine, StageHandler,
    fire_logged,
};
use hubvpn_transport::Connection;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub(super) fn stage(
    context: &Arc<ClientContext>,
    connection: &Arc<Connection>,
    machine: &Weak<SessionMachine>,
) -> Arc<StageHandler<SessionData>> {
    let request_conn = connection.clone();
    let configured = (context.clone(), connection.clone(), machine.clone());
    let fail_conn = connection.clone();
    let closed = (context.clone(), machine.clone());

    StageHandler::builder(DOWNLOAD_CONFIG, connection.clone())
        .after_resume(move || {
            let conn = request_conn.clone();
            async move {
                if let Err(e) = conn.send(&Message::ConfigRequest).await {
                    conn.close(&format!("failed to request config: {}", e)).await;
                }
            }
        })
        .on(MessageType::Config, move |message| {
            let (ctx, conn, machine) = configured.clone();
            async move { install(&ctx, &conn, &machine, message).await }
        })
        .on(MessageType::Fail, move |message| {
            let conn = fail_conn.clone();
            async move { server_failed(&conn, message).await }
        })
        .on_default(|message| async move {
            debug!("Ignoring {} while downloading config", message.message_type());
        })
        .on_close(move |reason| {
            let (ctx, machine) = closed.clone();
            async move { session_closed(&ctx, &machine, reason).await }
        })
        .build()
}

async fn install(
    ctx: &ClientContext,
    conn: &Connection,
    machine: &Weak<SessionMachine>,
    message: Message,
) {
    let Message::Config(config) = message else {
        return;
    };
    let Some(device) = ctx.device() else {
        conn.close("config received without a device").await;
        return;
    };

    for route in &config.routes {
        let net = match route.to_net() {
            Ok(net) => net,
            Err(e) => {
                conn.close(&format!("invalid route {}: {}", route, e)).await;
                return;
            }
        };
        if let Err(e) = device.add_route(net).await {
            conn.close(&format!("failed to add route {}: {}", net, e))
                .await;
            return;
        }
    }

    info!("Installed {} routes", config.routes.len());
    let address = ctx.authorization.lock().as_ref().map(|a| a.client_ip());
    fire_logged(machine, DOWNLOAD_CONFIG_SUCCESSFULLY, address);
}
