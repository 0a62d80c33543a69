//! Reflexive-endpoint discovery via a minimal STUN binding request.
//!
//! The agent only needs its server-reflexive address to report in the
//! `join` message; full ICE candidate gathering is out of scope.

use anyhow::Result;
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Public STUN servers tried in order until one answers.
pub const STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun2.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xa4, 0x42];
const BINDING_REQUEST: [u8; 2] = [0x00, 0x01];
const BINDING_SUCCESS: [u8; 2] = [0x01, 0x01];
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;

/// Sends a binding request to each server in turn and returns the first
/// reflexive address discovered.
pub async fn discover_public_endpoint(servers: &[String]) -> Result<SocketAddr> {
    if servers.is_empty() {
        anyhow::bail!("no STUN servers configured");
    }

    for server in servers {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(_) => continue,
        };
        if socket.connect(server.as_str()).await.is_err() {
            debug!("STUN server {} unreachable", server);
            continue;
        }

        let mut request = [0u8; 20];
        request[0..2].copy_from_slice(&BINDING_REQUEST);
        request[4..8].copy_from_slice(&MAGIC_COOKIE);
        for byte in request[8..20].iter_mut() {
            *byte = rand::random();
        }

        if socket.send(&request).await.is_err() {
            continue;
        }

        let mut response = [0u8; 1024];
        let n = match timeout(Duration::from_secs(3), socket.recv(&mut response)).await {
            Ok(Ok(n)) => n,
            _ => {
                debug!("STUN server {} timed out", server);
                continue;
            }
        };

        if n >= 20 && response[0..2] == BINDING_SUCCESS {
            if let Some(addr) = parse_mapped_address(&response[..n]) {
                info!("STUN reflexive endpoint {} (via {})", addr, server);
                return Ok(addr);
            }
        }
    }

    anyhow::bail!("all STUN servers failed")
}

/// Walks the attributes of a binding response and extracts the mapped
/// address, preferring XOR-MAPPED-ADDRESS. IPv4 only.
fn parse_mapped_address(response: &[u8]) -> Option<SocketAddr> {
    let msg_len = u16::from_be_bytes([response[2], response[3]]) as usize;
    let attrs = response.get(20..20 + msg_len)?;

    let mut fallback = None;
    let mut pos = 0;
    while pos + 4 <= attrs.len() {
        let attr_type = u16::from_be_bytes([attrs[pos], attrs[pos + 1]]);
        let attr_len = u16::from_be_bytes([attrs[pos + 2], attrs[pos + 3]]) as usize;
        let value = attrs.get(pos + 4..pos + 4 + attr_len)?;

        if attr_len >= 8 && value[1] == 0x01 {
            // family 0x01 = IPv4
            let mut port = u16::from_be_bytes([value[2], value[3]]);
            let mut ip = [value[4], value[5], value[6], value[7]];
            match attr_type {
                ATTR_XOR_MAPPED_ADDRESS => {
                    port ^= u16::from_be_bytes([MAGIC_COOKIE[0], MAGIC_COOKIE[1]]);
                    for (b, m) in ip.iter_mut().zip(MAGIC_COOKIE.iter()) {
                        *b ^= m;
                    }
                    return Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port));
                }
                ATTR_MAPPED_ADDRESS => {
                    fallback = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port));
                }
                _ => {}
            }
        }

        // attributes are padded to 4-byte boundaries
        pos += 4 + attr_len.div_ceil(4) * 4;
    }
    fallback
}
