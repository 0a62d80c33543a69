//! Ethernet frame codec.
//!
//! Fixed 14-byte DIX headers only; VLAN tags are not parsed. A frame is a
//! borrowed view over the raw bytes so the hot path never copies.

use crate::identity::Address;
use anyhow::Result;
use std::fmt;

/// Minimum Ethernet header size (no VLAN tag).
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Minimum valid frame size.
pub const MIN_FRAME_SIZE: usize = ETHERNET_HEADER_SIZE;

/// Maximum frame size carried on the overlay (jumbo frame).
pub const MAX_FRAME_SIZE: usize = 9000;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// A 6-byte hardware address.
pub type Mac = [u8; 6];

pub const BROADCAST_MAC: Mac = [0xff; 6];

/// Formats a MAC address as `aa:bb:cc:dd:ee:ff` for logging.
pub fn format_mac(mac: &Mac) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Derives the deterministic locally-administered MAC for a node on a
/// network: `02 : <low 16 bits of network id> : <first 3 address bytes>`.
/// Stable for the (network, node) pair.
pub fn virtual_mac(network_id: u32, node_addr: &Address) -> Mac {
    let nid = network_id.to_be_bytes();
    let addr = node_addr.as_bytes();
    [0x02, nid[2], nid[3], addr[0], addr[1], addr[2]]
}

/// A parsed view over a raw Ethernet frame.
pub struct EthernetFrame<'a> {
    raw: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < MIN_FRAME_SIZE {
            anyhow::bail!("frame too short: {} bytes", data.len());
        }
        Ok(EthernetFrame { raw: data })
    }

    pub fn dst_mac(&self) -> Mac {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.raw[0..6]);
        mac
    }

    pub fn src_mac(&self) -> Mac {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.raw[6..12]);
        mac
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.raw[12], self.raw[13]])
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.raw[ETHERNET_HEADER_SIZE..]
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn is_broadcast(&self) -> bool {
        self.raw[0..6] == BROADCAST_MAC
    }

    /// Multicast MACs have the low bit of the first byte set; broadcast is
    /// a subset.
    pub fn is_multicast(&self) -> bool {
        self.raw[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    pub fn is_arp(&self) -> bool {
        self.ethertype() == ETHERTYPE_ARP
    }
}

impl fmt::Display for EthernetFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ethertype = match self.ethertype() {
            ETHERTYPE_IPV4 => "IPv4".to_string(),
            ETHERTYPE_ARP => "ARP".to_string(),
            ETHERTYPE_IPV6 => "IPv6".to_string(),
            other => format!("0x{:04x}", other),
        };
        write!(
            f,
            "{} -> {} [{}] {} bytes",
            format_mac(&self.src_mac()),
            format_mac(&self.dst_mac()),
            ethertype,
            self.raw.len()
        )
    }
}
