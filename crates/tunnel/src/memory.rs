//! Channel-backed tunnel device

use crate::device::{DeviceConfig, DeviceError, DeviceOpener, TunnelDevice};
use async_trait::async_trait;
use bytes::Bytes;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Device whose packets come from and go to in-process channels.
///
/// Reads return packets injected through the paired `MemoryHandle`; writes
/// show up on the handle.
pub struct MemoryDevice {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    routes: Arc<Mutex<Vec<Ipv4Net>>>,
    closed: watch::Sender<bool>,
}

/// Far side of a `MemoryDevice`
pub struct MemoryHandle {
    inject: mpsc::UnboundedSender<Bytes>,
    written: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    routes: Arc<Mutex<Vec<Ipv4Net>>>,
    closed: watch::Receiver<bool>,
}

impl MemoryDevice {
    pub fn new() -> (Arc<Self>, MemoryHandle) {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);
        let routes = Arc::new(Mutex::new(Vec::new()));

        let device = Arc::new(Self {
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            routes: routes.clone(),
            closed,
        });
        let handle = MemoryHandle {
            inject,
            written: tokio::sync::Mutex::new(written),
            routes,
            closed: closed_rx,
        };

        (device, handle)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl TunnelDevice for MemoryDevice {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        let packet = tokio::select! {
            packet = inbound.recv() => packet.ok_or(DeviceError::Closed)?,
            _ = closed.wait_for(|closed| *closed) => return Err(DeviceError::Closed),
        };

        if packet.len() > buf.len() {
            return Err(DeviceError::PacketTooLarge {
                packet: packet.len(),
                buffer: buf.len(),
            });
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| DeviceError::Closed)?;
        Ok(packet.len())
    }

    async fn add_route(&self, net: Ipv4Net) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        self.routes.lock().push(net);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.routes.lock().clear();
        debug!("Memory device closed");
        Ok(())
    }
}

impl MemoryHandle {
    /// Queue a packet for the device to read
    pub fn inject(&self, packet: impl Into<Bytes>) -> bool {
        self.inject.send(packet.into()).is_ok()
    }

    /// Next packet written to the device
    pub async fn next_written(&self) -> Option<Bytes> {
        self.written.lock().await.recv().await
    }

    /// Packet already written, if any
    pub fn try_written(&self) -> Option<Bytes> {
        self.written.try_lock().ok()?.try_recv().ok()
    }

    /// Routes currently installed
    pub fn routes(&self) -> Vec<Ipv4Net> {
        self.routes.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Opener handing out one prepared `MemoryDevice` and recording the
/// configuration it was opened with
pub struct MemoryOpener {
    device: Mutex<Option<Arc<MemoryDevice>>>,
    opened: Mutex<Option<DeviceConfig>>,
}

impl MemoryOpener {
    pub fn new(device: Arc<MemoryDevice>) -> Self {
        Self {
            device: Mutex::new(Some(device)),
            opened: Mutex::new(None),
        }
    }

    /// Configuration of the open call, once it happened
    pub fn opened(&self) -> Option<DeviceConfig> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl DeviceOpener for MemoryOpener {
    async fn open(&self, config: DeviceConfig) -> Result<Arc<dyn TunnelDevice>, DeviceError> {
        let device = self
            .device
            .lock()
            .take()
            .ok_or_else(|| DeviceError::Open("memory device already taken".to_string()))?;
        *self.opened.lock() = Some(config);
        Ok(device)
    }
}
