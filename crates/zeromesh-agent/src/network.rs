//! A virtual network instance on this node: descriptor, learning switch,
//! ARP proxy, and the node's stable virtual MAC.

use crate::arp::ArpProxy;
use crate::frame::{virtual_mac, Mac};
use crate::identity::Address;
use crate::switch::{PeerSender, Switch};
use log::warn;
use std::sync::Arc;
use zeromesh_proto::{MAX_MTU, MIN_MTU};

/// Configuration of one virtual network, as pushed by the controller or
/// assembled from flags in static mode.
#[derive(Debug, Clone)]
pub struct NetworkDescriptor {
    pub id: u32,
    pub name: String,
    pub ip_range: String,
    pub mtu: u16,
    pub multicast: bool,
}

/// Clamps a descriptor MTU into the supported range, warning when the
/// requested value is out of bounds.
pub fn clamp_mtu(mtu: u16) -> u16 {
    let clamped = mtu.clamp(MIN_MTU, MAX_MTU);
    if clamped != mtu {
        warn!("mtu {} out of range, clamped to {}", mtu, clamped);
    }
    clamped
}

pub struct Network {
    pub descriptor: NetworkDescriptor,
    pub switch: Switch,
    pub arp: ArpProxy,
    pub local_mac: Mac,
}

impl Network {
    pub fn new(
        descriptor: NetworkDescriptor,
        node_addr: Address,
        sender: Arc<dyn PeerSender>,
    ) -> Self {
        let local_mac = virtual_mac(descriptor.id, &node_addr);
        Network {
            switch: Switch::new(descriptor.id, sender),
            arp: ArpProxy::new(),
            local_mac,
            descriptor,
        }
    }
}
