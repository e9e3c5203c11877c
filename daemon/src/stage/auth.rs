//! Authentication stage: check credentials and lease an address

use super::ServerContext;
use hubvpn_protocol::{Authorization, Fail, Message, MessageType, PROTOCOL_VERSION, fail_code};
use hubvpn_session::{
    AUTHENTICATE_SUCCESSFULLY, AUTHENTICATION, SessionData, SessionMachine, StageHandler,
    fire_logged,
};
use hubvpn_transport::Connection;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

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

    StageHandler::builder(AUTHENTICATION, connection.clone())
        .on(MessageType::Authentication, move |message| {
            let ctx = ctx.clone();
            let conn = conn.clone();
            let machine = machine.clone();
            async move { authenticate(&ctx, &conn, &machine, message).await }
        })
        .on_default(move |message| async move {
            debug!(%peer, "Ignoring {} before authentication", message.message_type());
        })
        .on_close(move |_reason| {
            let ctx = on_close_ctx.clone();
            async move {
                ctx.release(&peer);
            }
        })
        .build()
}

async fn authenticate(
    ctx: &ServerContext,
    conn: &Connection,
    machine: &Weak<SessionMachine>,
    message: Message,
) {
    let Message::Authentication(auth) = message else {
        return;
    };
    let peer = conn.peer_addr();

    if auth.version != PROTOCOL_VERSION {
        debug!(%peer, "Client version {} differs from {}", auth.version, PROTOCOL_VERSION);
    }

    if !ctx.authorize(&auth) {
        warn!(%peer, account = %auth.account, "Invalid authentication");
        reject(conn, fail_code::UNAUTHORIZED, "invalid authentication").await;
        return;
    }

    let address = match ctx.lease(peer) {
        Ok(address) => address,
        Err(e) => {
            warn!(%peer, "No address for client: {}", e);
            reject(conn, fail_code::POOL_EXHAUSTED, &e.to_string()).await;
            return;
        }
    };

    let reply = Authorization {
        version: PROTOCOL_VERSION.to_string(),
        server_address: ctx.server_address().into(),
        client_address: address.into(),
    };
    if let Err(e) = conn.send(&reply.into()).await {
        conn.close(&format!("failed to send authorization: {}", e))
            .await;
        return;
    }

    info!(%peer, %address, account = %auth.account, "Client authorized");
    fire_logged(machine, AUTHENTICATE_SUCCESSFULLY, Some(address));
}

/// Tell the client why, then hang up
async fn reject(conn: &Connection, code: u16, reason: &str) {
    let fail = Fail {
        code,
        message: reason.to_string(),
    };
    if let Err(e) = conn.send(&fail.into()).await {
        debug!(peer = %conn.peer_addr(), "Failed to send rejection: {}", e);
    }
    conn.close(reason).await;
}
