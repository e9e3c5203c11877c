//! Communication stage: relay packets between the client and the device

use super::{ServerContext, StageError};
use hubvpn_protocol::{Message, MessageType};
use hubvpn_session::{COMMUNICATION, SessionData, StageHandler};
use hubvpn_transport::Connection;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub(super) fn stage(
    context: &Arc<ServerContext>,
    connection: &Arc<Connection>,
) -> Arc<StageHandler<SessionData>> {
    let enter_ctx = context.clone();
    let enter_conn = connection.clone();
    let packet_ctx = context.clone();
    let on_close_ctx = context.clone();
    let peer = connection.peer_addr();

    StageHandler::builder(COMMUNICATION, connection.clone())
        .on_enter(move |_, data: &SessionData| {
            let address = data.ok_or(StageError::MissingAddress(COMMUNICATION))?;
            enter_ctx.router().register(address, enter_conn.clone());
            // the connection may have closed and released the lease meanwhile
            if enter_ctx.lease_of(&peer) != Some(address) {
                enter_ctx.router().unregister(address);
                return Err(StageError::LeaseReleased(address).into());
            }
            info!(%peer, %address, "Client joined the virtual network");
            Ok(())
        })
        .on(MessageType::Packet, move |message| {
            let ctx = packet_ctx.clone();
            async move {
                let Message::Packet(packet) = message else {
                    return;
                };
                trace!(%peer, "Client packet of {} bytes", packet.len());
                if let Err(e) = ctx.router().write(&packet).await {
                    warn!(%peer, "Device write failed: {}", e);
                }
            }
        })
        .on_default(move |message| async move {
            debug!(%peer, "Ignoring {} during communication", message.message_type());
        })
        .on_close(move |_reason| {
            let ctx = on_close_ctx.clone();
            async move {
                ctx.release(&peer);
            }
        })
        .build()
}
