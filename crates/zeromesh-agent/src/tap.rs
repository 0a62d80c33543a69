//! Kernel tap device.
//!
//! Linux is the only supported platform: the device is created in L2 mode
//! and MTU/MAC/address configuration is applied with `ip(8)`. Other
//! platforms get a stub that refuses to start, so the rest of the agent
//! compiles everywhere.

use crate::frame::{format_mac, Mac, MAX_FRAME_SIZE};
use anyhow::Result;

/// Tap read/write buffer size: maximum frame plus header headroom.
pub const TAP_BUFFER_SIZE: usize = MAX_FRAME_SIZE + 64;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use anyhow::Context;
    use log::{debug, info};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::process::Command;

    /// A Linux kernel tap interface.
    pub struct TapDevice {
        device: tun::AsyncDevice,
        name: String,
    }

    /// Read half of a tap device; one `read` returns one Ethernet frame.
    pub struct TapReader {
        inner: ReadHalf<tun::AsyncDevice>,
    }

    /// Write half of a tap device; one `write` injects one Ethernet frame.
    pub struct TapWriter {
        inner: WriteHalf<tun::AsyncDevice>,
    }

    impl TapDevice {
        /// Creates the tap interface with the given name and MTU.
        pub fn open(name: &str, mtu: u16) -> Result<Self> {
            let mut config = tun::Configuration::default();
            config.layer(tun::Layer::L2);
            config.name(name);
            config.mtu(mtu as i32);
            config.up();
            config.platform(|p| {
                p.packet_information(false);
            });

            let device = tun::create_as_async(&config).context("create tap device")?;
            info!("tap device '{}' created (mtu {})", name, mtu);
            Ok(TapDevice {
                device,
                name: name.to_string(),
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Sets the interface MAC address. The link must be down while the
        /// address changes.
        pub async fn set_mac(&self, mac: &Mac) -> Result<()> {
            run_ip(&["link", "set", "dev", &self.name, "down"]).await?;
            run_ip(&["link", "set", "dev", &self.name, "address", &format_mac(mac)]).await?;
            run_ip(&["link", "set", "dev", &self.name, "up"]).await
        }

        pub async fn set_mtu(&self, mtu: u16) -> Result<()> {
            run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string()]).await
        }

        /// Assigns an address in CIDR form (e.g. `10.147.17.1/24`).
        pub async fn add_address(&self, cidr: &str) -> Result<()> {
            run_ip(&["addr", "add", cidr, "dev", &self.name]).await
        }

        pub async fn set_up(&self) -> Result<()> {
            run_ip(&["link", "set", "dev", &self.name, "up"]).await
        }

        pub fn split(self) -> (TapReader, TapWriter) {
            let (reader, writer) = tokio::io::split(self.device);
            (TapReader { inner: reader }, TapWriter { inner: writer })
        }
    }

    impl TapReader {
        pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.inner.read(buf).await
        }
    }

    impl TapWriter {
        pub async fn write(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.inner.write_all(frame).await
        }
    }

    async fn run_ip(args: &[&str]) -> Result<()> {
        debug!("ip {}", args.join(" "));
        let status = Command::new("ip")
            .args(args)
            .status()
            .await
            .context("run ip")?;
        if !status.success() {
            anyhow::bail!("ip {} exited with {}", args.join(" "), status);
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    /// Stub for unsupported platforms.
    pub struct TapDevice {
        name: String,
    }

    pub struct TapReader;
    pub struct TapWriter;

    impl TapDevice {
        pub fn open(_name: &str, _mtu: u16) -> Result<Self> {
            anyhow::bail!(
                "tap devices are not supported on {} (Linux required)",
                std::env::consts::OS
            )
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub async fn set_mac(&self, _mac: &Mac) -> Result<()> {
            anyhow::bail!("tap stub")
        }

        pub async fn set_mtu(&self, _mtu: u16) -> Result<()> {
            anyhow::bail!("tap stub")
        }

        pub async fn add_address(&self, _cidr: &str) -> Result<()> {
            anyhow::bail!("tap stub")
        }

        pub async fn set_up(&self) -> Result<()> {
            anyhow::bail!("tap stub")
        }

        pub fn split(self) -> (TapReader, TapWriter) {
            (TapReader, TapWriter)
        }
    }

    impl TapReader {
        pub async fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "tap stub",
            ))
        }
    }

    impl TapWriter {
        pub async fn write(&mut self, _frame: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "tap stub",
            ))
        }
    }
}

pub use imp::{TapDevice, TapReader, TapWriter};
