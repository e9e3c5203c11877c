//! Virtual network router
//!
//! Fans packets read from the shared device out to the session owning the
//! destination address, and funnels packets from every session into the
//! device.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use hubvpn_protocol::Message;
use hubvpn_transport::{Connection, ConnectionError};
use hubvpn_tunnel::{DeviceError, MAX_PACKET_SIZE, TunnelDevice, packet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Packets queued per destination before new ones are dropped
pub const SINK_QUEUE_SIZE: usize = 256;

/// Destination for packets routed to one virtual address
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn deliver(&self, packet: Bytes) -> Result<(), ConnectionError>;
}

#[async_trait]
impl PacketSink for Connection {
    async fn deliver(&self, packet: Bytes) -> Result<(), ConnectionError> {
        self.send(&Message::Packet(packet)).await
    }
}

/// Queue feeding one sink, drained by its own task
struct SinkQueue {
    queue: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl SinkQueue {
    fn spawn(address: Ipv4Addr, sink: Arc<dyn PacketSink>) -> Self {
        let (queue, mut rx) = mpsc::channel::<Bytes>(SINK_QUEUE_SIZE);
        let task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                match sink.deliver(packet).await {
                    Ok(()) => {}
                    Err(ConnectionError::Closed) => break,
                    Err(e) => warn!("Delivery to {} failed: {}", address, e),
                }
            }
            trace!("Delivery to {} stopped", address);
        });
        Self { queue, task }
    }
}

impl Drop for SinkQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Router {
    device: Arc<dyn TunnelDevice>,
    routes: DashMap<Ipv4Addr, SinkQueue>,
}

impl Router {
    pub fn new(device: Arc<dyn TunnelDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            routes: DashMap::new(),
        })
    }

    pub fn device(&self) -> &Arc<dyn TunnelDevice> {
        &self.device
    }

    /// Route packets for `address` to `sink`, replacing any previous owner.
    /// Must be called inside a tokio runtime.
    pub fn register(&self, address: Ipv4Addr, sink: Arc<dyn PacketSink>) {
        let queue = SinkQueue::spawn(address, sink);
        if self.routes.insert(address, queue).is_some() {
            warn!("Replaced router entry for {}", address);
        }
        debug!("Router entry added for {}", address);
    }

    pub fn unregister(&self, address: Ipv4Addr) -> bool {
        let removed = self.routes.remove(&address).is_some();
        if removed {
            debug!("Router entry removed for {}", address);
        }
        removed
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.routes.contains_key(&address)
    }

    pub fn count(&self) -> usize {
        self.routes.len()
    }

    /// Write a packet received from a session into the device
    pub async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError> {
        self.device.write(packet).await
    }

    /// Queue one device packet for its owner. Returns false if it was dropped.
    pub fn dispatch(&self, packet: Bytes) -> bool {
        let Some(destination) = packet::destination(&packet) else {
            trace!("Dropped non-IPv4 packet of {} bytes", packet.len());
            return false;
        };

        let Some(entry) = self.routes.get(&destination) else {
            trace!("No route for {}, dropped", destination);
            return false;
        };

        match entry.queue.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Queue for {} full, dropped", destination);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Owner of {} gone, dropped", destination);
                false
            }
        }
    }

    /// Pump the device until it closes
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        info!("Router started");

        loop {
            let n = match self.device.read(&mut buf).await {
                Ok(n) => n,
                Err(DeviceError::Closed) => break,
                Err(e) => {
                    warn!("Device read error: {}", e);
                    break;
                }
            };
            self.dispatch(Bytes::copy_from_slice(&buf[..n]));
        }

        info!("Router stopped");
    }
}
