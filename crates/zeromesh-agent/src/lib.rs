//! ZeroMesh agent: an encrypted virtual Layer-2 overlay over UDP.
//!
//! Each agent exposes a kernel tap device; Ethernet frames written to it
//! are learned by a per-network virtual switch, encrypted per peer link,
//! and carried over the public Internet to the other members of the same
//! virtual network.

pub mod agent;
pub mod arp;
pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod network;
pub mod noise;
pub mod packet;
pub mod peers;
pub mod stun;
pub mod switch;
pub mod tap;
pub mod transport;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::{CipherError, SendError};
pub use identity::{Address, Identity};
pub use metrics::Metrics;
pub use network::{Network, NetworkDescriptor};
pub use peers::{Peer, PeerState, PeerTable};
