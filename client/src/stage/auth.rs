//! Authentication stage: present credentials, open the device

use super::{ClientContext, server_failed, session_closed};
use hubvpn_protocol::{Authentication, Message, MessageType, PROTOCOL_VERSION};
use hubvpn_session::{
    AUTHENTICATE_SUCCESSFULLY, AUTHENTICATION, SessionData, SessionMachine, StageHandler,
    fire_logged,
};
use hubvpn_transport::Connection;
use hubvpn_tunnel::DeviceConfig;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub(super) fn stage(
    context: &Arc<ClientContext>,
    connection: &Arc<Connection>,
    machine: &Weak<SessionMachine>,
) -> Arc<StageHandler<SessionData>> {
    let hello = (context.clone(), connection.clone());
    let authorized = (context.clone(), connection.clone(), machine.clone());
    let fail_conn = connection.clone();
    let closed = (context.clone(), machine.clone());

    StageHandler::builder(AUTHENTICATION, connection.clone())
        .after_resume(move || {
            let (ctx, conn) = hello.clone();
            async move {
                let auth = Authentication {
                    version: PROTOCOL_VERSION.to_string(),
                    account: ctx.settings.account.clone(),
                    password: ctx.settings.password.clone(),
                };
                if let Err(e) = conn.send(&auth.into()).await {
                    conn.close(&format!("failed to send authentication: {}", e))
                        .await;
                }
            }
        })
        .on(MessageType::Authorization, move |message| {
            let (ctx, conn, machine) = authorized.clone();
            async move { authorized_by(&ctx, &conn, &machine, message).await }
        })
        .on(MessageType::Fail, move |message| {
            let conn = fail_conn.clone();
            async move { server_failed(&conn, message).await }
        })
        .on_default(|message| async move {
            debug!("Ignoring {} before authorization", message.message_type());
        })
        .on_close(move |reason| {
            let (ctx, machine) = closed.clone();
            async move { session_closed(&ctx, &machine, reason).await }
        })
        .build()
}

async fn authorized_by(
    ctx: &ClientContext,
    conn: &Connection,
    machine: &Weak<SessionMachine>,
    message: Message,
) {
    let Message::Authorization(authorization) = message else {
        return;
    };
    let client = authorization.client_ip();
    let server = authorization.server_ip();

    let config = DeviceConfig::new(&ctx.settings.device_name, client)
        .with_destination(server)
        .with_mtu(ctx.settings.mtu);
    let device = match ctx.opener.open(config).await {
        Ok(device) => device,
        Err(e) => {
            conn.close(&format!("failed to open device: {}", e)).await;
            return;
        }
    };

    if ctx.closed.borrow().is_some() {
        if let Err(e) = device.close().await {
            warn!("Failed to close device of an ended session: {}", e);
        }
        return;
    }

    *ctx.device.lock() = Some(device);
    *ctx.authorization.lock() = Some(authorization);

    info!(%client, %server, "Authorized");
    fire_logged(machine, AUTHENTICATE_SUCCESSFULLY, Some(client));
}
