//! Control-plane protocol for ZeroMesh.
//!
//! The agent and the controller exchange JSON messages over a bidirectional
//! WebSocket connection, one object per message. This crate defines the
//! message taxonomy plus the handful of constants both sides must agree on.
//!
//! Agent → controller: `join`, `status`, `leave`.
//! Controller → agent: `network_config`, `peer_update`, `error`.

use serde::{Deserialize, Serialize};

/// Default UDP port for the overlay transport.
pub const DEFAULT_UDP_PORT: u16 = 9993;

/// Default overlay MTU when the descriptor does not carry one.
pub const DEFAULT_MTU: u16 = 2800;

/// Smallest MTU a network descriptor may request.
pub const MIN_MTU: u16 = 1280;

/// Largest MTU a network descriptor may request (jumbo frames).
pub const MAX_MTU: u16 = 9000;

/// HTTP path on the controller accepting agent WebSocket connections.
pub const AGENT_CONNECT_PATH: &str = "/api/v1/agent/connect";

/// Connect-request header carrying the agent's node address (hex).
/// The controller treats this as an untrusted hint; the public keys in
/// `network_config` are the authority.
pub const HEADER_NODE_ADDRESS: &str = "X-Node-Address";

/// Connect-request header carrying the agent's public key (hex).
pub const HEADER_PUBLIC_KEY: &str = "X-Public-Key";

/// A control-channel message. The `type` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sent by the agent right after connecting.
    Join {
        node_addr: String,
        public_key: String,
        networks: Vec<String>,
        /// Public-facing UDP endpoints as observed by the agent.
        endpoints: Vec<String>,
        platform: String,
        version: String,
    },

    /// Periodic agent report carrying per-peer connectivity.
    Status { peers: Vec<PeerStatus> },

    /// Sent when the agent leaves one or more networks.
    Leave { networks: Vec<String> },

    /// Full network descriptor pushed by the controller.
    NetworkConfig {
        network_id: String,
        name: String,
        ip_range: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip6_range: Option<String>,
        #[serde(default)]
        mtu: u16,
        #[serde(default)]
        multicast: bool,
        /// Network pre-shared key, hex encoded (64 chars).
        psk: String,
        /// IP/mask assigned to this node, CIDR form.
        assigned_ip: String,
        peers: Vec<PeerInfo>,
    },

    /// Incremental roster change pushed by the controller.
    PeerUpdate { action: PeerAction, peer: PeerInfo },

    /// Error report from the controller. The agent logs it and keeps
    /// waiting for a corrected `network_config`.
    Error { code: i32, message: String },
}

/// Roster action inside a `peer_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerAction {
    Add,
    Remove,
}

/// A peer as described by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// 5-byte node address, hex encoded.
    pub address: String,
    /// Curve25519 public key, hex encoded.
    pub public_key: String,
    /// Candidate UDP endpoints, `host:port`.
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Per-peer connectivity inside a `status` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub address: String,
    pub latency_ms: i64,
    /// Currently always `"direct"`; relay classification is not computed.
    pub path: String,
    pub bytes_sent: i64,
    pub bytes_recv: i64,
}
