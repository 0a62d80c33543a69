//! Agent runtime configuration.
//!
//! Everything arrives via CLI flags; validation failures here are fatal at
//! startup. In controlled mode the PSK and network descriptor are replaced
//! by whatever the controller pushes.

use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use zeromesh_proto::{DEFAULT_MTU, DEFAULT_UDP_PORT};

pub const DEFAULT_IDENTITY_PATH: &str = "/etc/zeromesh/identity.key";
pub const DEFAULT_TAP_NAME: &str = "zm0";

/// A statically configured peer.
#[derive(Debug, Clone)]
pub struct StaticPeer {
    pub public_key: [u8; 32],
    pub endpoint: SocketAddr,
}

/// Runtime configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity_path: PathBuf,
    pub listen_port: u16,
    pub tap_name: String,
    /// IP/mask to assign to the tap in static mode, CIDR form.
    pub tap_ipv4: Option<String>,
    pub tap_mtu: u16,
    pub network_id: u32,
    pub psk: [u8; 32],
    pub static_peers: Vec<StaticPeer>,
    pub controller_url: Option<String>,
    /// Port for the local introspection endpoint; 0 disables it.
    pub metrics_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            identity_path: PathBuf::from(DEFAULT_IDENTITY_PATH),
            listen_port: DEFAULT_UDP_PORT,
            tap_name: DEFAULT_TAP_NAME.to_string(),
            tap_ipv4: None,
            tap_mtu: DEFAULT_MTU,
            network_id: 1,
            psk: [0u8; 32],
            static_peers: Vec::new(),
            controller_url: None,
            metrics_port: 0,
        }
    }
}

/// Parses a hex-encoded 32-byte pre-shared key (64 characters).
pub fn parse_psk_hex(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).context("PSK must be hex")?;
    if bytes.len() != 32 {
        anyhow::bail!("PSK must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }
    let mut psk = [0u8; 32];
    psk.copy_from_slice(&bytes);
    Ok(psk)
}

/// Parses a comma-separated static peer list: `pubkey@host:port[,...]`.
/// Host names are resolved once, at startup.
pub fn parse_peer_specs(s: &str) -> Result<Vec<StaticPeer>> {
    let mut peers = Vec::new();
    for spec in s.split(',').filter(|p| !p.is_empty()) {
        let (key_hex, hostport) = spec
            .split_once('@')
            .with_context(|| format!("invalid peer spec '{}', expected pubkey@host:port", spec))?;

        let key_bytes = hex::decode(key_hex)
            .with_context(|| format!("invalid public key in peer spec '{}'", spec))?;
        if key_bytes.len() != 32 {
            anyhow::bail!("public key in peer spec '{}' must be 32 bytes", spec);
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&key_bytes);

        let endpoint = hostport
            .to_socket_addrs()
            .with_context(|| format!("resolve peer endpoint '{}'", hostport))?
            .next()
            .with_context(|| format!("no address for peer endpoint '{}'", hostport))?;

        peers.push(StaticPeer {
            public_key,
            endpoint,
        });
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_psk_hex() {
        let psk = parse_psk_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(psk, [0xab; 32]);
        assert!(parse_psk_hex("abcd").is_err());
        assert!(parse_psk_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_parse_peer_specs() {
        let spec = format!("{}@127.0.0.1:9993", "11".repeat(32));
        let peers = parse_peer_specs(&spec).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, [0x11; 32]);
        assert_eq!(peers[0].endpoint, "127.0.0.1:9993".parse().unwrap());
    }

    #[test]
    fn test_parse_multiple_peer_specs() {
        let spec = format!(
            "{}@127.0.0.1:9993,{}@127.0.0.1:9994",
            "11".repeat(32),
            "22".repeat(32)
        );
        let peers = parse_peer_specs(&spec).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].endpoint.port(), 9994);
    }

    #[test]
    fn test_parse_peer_specs_rejects_malformed() {
        assert!(parse_peer_specs("no-at-sign").is_err());
        assert!(parse_peer_specs("abcd@127.0.0.1:9993").is_err());
        let no_port = format!("{}@127.0.0.1", "11".repeat(32));
        assert!(parse_peer_specs(&no_port).is_err());
    }
}
