//! UDP transport for the overlay.

use crate::error::SendError;
use crate::packet::Packet;
use anyhow::{Context, Result};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// The bound overlay socket, shared by the read loop and all send paths.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
}

impl UdpTransport {
    /// Binds the overlay socket. Port 0 asks the OS for an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind UDP port {}", port))?;
        let port = socket.local_addr()?.port();
        info!("overlay transport listening on udp/{}", port);
        Ok(UdpTransport {
            socket: Arc::new(socket),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), SendError> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    pub async fn send_packet(&self, packet: &Packet, addr: SocketAddr) -> Result<(), SendError> {
        self.send_to(&packet.encode(), addr).await
    }
}
