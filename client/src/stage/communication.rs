//! Communication stage: pump packets between the device and the server

use super::{ClientContext, server_failed, session_closed};
use bytes::Bytes;
use hubvpn_protocol::{Message, MessageType};
use hubvpn_session::{COMMUNICATION, SessionData, SessionMachine, StageHandler};
use hubvpn_transport::{Connection, ConnectionError};
use hubvpn_tunnel::{DeviceError, MAX_PACKET_SIZE, TunnelDevice};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

pub(super) fn stage(
    context: &Arc<ClientContext>,
    connection: &Arc<Connection>,
    machine: &Weak<SessionMachine>,
) -> Arc<StageHandler<SessionData>> {
    let forward = (context.clone(), connection.clone());
    let inbound_ctx = context.clone();
    let fail_conn = connection.clone();
    let closed = (context.clone(), machine.clone());

    StageHandler::builder(COMMUNICATION, connection.clone())
        .after_resume(move || {
            let (ctx, conn) = forward.clone();
            async move {
                match ctx.device() {
                    Some(device) => {
                        tokio::spawn(forward_device(device, conn));
                    }
                    None => conn.close("communication started without a device").await,
                }
            }
        })
        .on(MessageType::Packet, move |message| {
            let ctx = inbound_ctx.clone();
            async move {
                let Message::Packet(packet) = message else {
                    return;
                };
                let Some(device) = ctx.device() else {
                    return;
                };
                if let Err(e) = device.write(&packet).await {
                    warn!("Device write failed: {}", e);
                }
            }
        })
        .on(MessageType::Fail, move |message| {
            let conn = fail_conn.clone();
            async move { server_failed(&conn, message).await }
        })
        .on_default(|message| async move {
            debug!("Ignoring {} during communication", message.message_type());
        })
        .on_close(move |reason| {
            let (ctx, machine) = closed.clone();
            async move { session_closed(&ctx, &machine, reason).await }
        })
        .build()
}

/// Send every packet read from the device to the server
async fn forward_device(device: Arc<dyn TunnelDevice>, conn: Arc<Connection>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    info!("Forwarding device traffic");

    loop {
        let n = match device.read(&mut buf).await {
            Ok(n) => n,
            Err(DeviceError::Closed) => break,
            Err(e) => {
                warn!("Device read error: {}", e);
                conn.close(&format!("device read failed: {}", e)).await;
                break;
            }
        };

        trace!("Device packet of {} bytes", n);
        match conn
            .send(&Message::Packet(Bytes::copy_from_slice(&buf[..n])))
            .await
        {
            Ok(()) => {}
            Err(ConnectionError::Closed) => break,
            Err(e) => warn!("Dropped device packet: {}", e),
        }
    }

    debug!("Device forwarding stopped");
}
