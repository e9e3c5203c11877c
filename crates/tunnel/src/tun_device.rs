//! Kernel TUN device
//!
//! - Linux: uses the `tun` crate's async device
//! - Other platforms: opening fails

use crate::device::{DeviceConfig, DeviceError, DeviceOpener, TunnelDevice};
use async_trait::async_trait;
use std::sync::Arc;

// ==================== Linux Implementation ====================
#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use ipnet::Ipv4Net;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::watch;
    use tracing::{debug, info};
    use tun::{AsyncDevice, Configuration};

    pub struct TunDevice {
        name: String,
        reader: tokio::sync::Mutex<ReadHalf<AsyncDevice>>,
        writer: tokio::sync::Mutex<WriteHalf<AsyncDevice>>,
        routes: Mutex<Vec<Ipv4Net>>,
        closed: watch::Sender<bool>,
    }

    impl TunDevice {
        pub fn create(config: &DeviceConfig) -> Result<Self, DeviceError> {
            let mut tun_config = Configuration::default();
            tun_config
                .name(&config.name)
                .address(config.address)
                .netmask(config.netmask)
                .mtu(i32::from(config.mtu))
                .up();
            if let Some(destination) = config.destination {
                tun_config.destination(destination);
            }
            tun_config.platform(|platform| {
                platform.packet_information(false);
            });

            let device =
                tun::create_as_async(&tun_config).map_err(|e| DeviceError::Open(e.to_string()))?;
            let (reader, writer) = tokio::io::split(device);
            let (closed, _) = watch::channel(false);

            info!(
                "Created TUN device {} with address {}/{}",
                config.name, config.address, config.netmask
            );

            Ok(Self {
                name: config.name.clone(),
                reader: tokio::sync::Mutex::new(reader),
                writer: tokio::sync::Mutex::new(writer),
                routes: Mutex::new(Vec::new()),
                closed,
            })
        }

        /// Routes added through this device
        pub fn routes(&self) -> Vec<Ipv4Net> {
            self.routes.lock().clone()
        }

        fn check_open(&self) -> Result<(), DeviceError> {
            if *self.closed.borrow() {
                return Err(DeviceError::Closed);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelDevice for TunDevice {
        async fn read(&self, buf: &mut [u8]) -> Result<usize, DeviceError> {
            let mut closed = self.closed.subscribe();
            self.check_open()?;

            let read = async { self.reader.lock().await.read(buf).await };
            let n = tokio::select! {
                result = read => result?,
                _ = closed.wait_for(|closed| *closed) => return Err(DeviceError::Closed),
            };
            if n == 0 {
                return Err(DeviceError::Closed);
            }
            Ok(n)
        }

        async fn write(&self, packet: &[u8]) -> Result<usize, DeviceError> {
            let mut closed = self.closed.subscribe();
            self.check_open()?;

            let write = async { self.writer.lock().await.write(packet).await };
            tokio::select! {
                result = write => Ok(result?),
                _ = closed.wait_for(|closed| *closed) => Err(DeviceError::Closed),
            }
        }

        async fn add_route(&self, net: Ipv4Net) -> Result<(), DeviceError> {
            self.check_open()?;
            // route table programming is left to the host
            self.routes.lock().push(net);
            debug!("Route {} via {}", net, self.name);
            Ok(())
        }

        async fn close(&self) -> Result<(), DeviceError> {
            // wakes reads and writes still waiting on the device
            if self.closed.send_replace(true) {
                return Ok(());
            }
            for net in self.routes.lock().drain(..) {
                debug!("Route {} via {} removed", net, self.name);
            }
            if let Err(e) = self.writer.lock().await.shutdown().await {
                debug!("TUN {} shutdown error: {}", self.name, e);
            }
            info!("Closed TUN device {}", self.name);
            Ok(())
        }
    }
}

// ==================== Stub for other platforms ====================
#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;
    use ipnet::Ipv4Net;

    pub struct TunDevice;

    impl TunDevice {
        pub fn create(_config: &DeviceConfig) -> Result<Self, DeviceError> {
            Err(DeviceError::Open(
                "TUN devices not supported on this platform".to_string(),
            ))
        }

        pub fn routes(&self) -> Vec<Ipv4Net> {
            Vec::new()
        }
    }

    #[async_trait]
    impl TunnelDevice for TunDevice {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize, DeviceError> {
            Err(DeviceError::Closed)
        }

        async fn write(&self, _packet: &[u8]) -> Result<usize, DeviceError> {
            Err(DeviceError::Closed)
        }

        async fn add_route(&self, _net: Ipv4Net) -> Result<(), DeviceError> {
            Err(DeviceError::Closed)
        }

        async fn close(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }
}

// Re-export platform-specific implementation
pub use platform::TunDevice;

/// Opens kernel TUN devices
#[derive(Debug, Default, Clone, Copy)]
pub struct TunOpener;

#[async_trait]
impl DeviceOpener for TunOpener {
    async fn open(&self, config: DeviceConfig) -> Result<Arc<dyn TunnelDevice>, DeviceError> {
        Ok(Arc::new(TunDevice::create(&config)?))
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    /// Needs CAP_NET_ADMIN. Run with: cargo test -p hubvpn-tunnel -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_close_wakes_pending_read() {
        let config = DeviceConfig::new("hubvpn-t0", Ipv4Addr::new(10, 250, 0, 1));
        let device = match TunDevice::create(&config) {
            Ok(device) => Arc::new(device),
            Err(e) => {
                println!("Skipping TUN test: {}", e);
                return;
            }
        };

        let reader = device.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        device.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("read should be woken by close")
            .unwrap();
        assert!(matches!(result, Err(DeviceError::Closed)));
    }
}
