//! ARP proxy.
//!
//! Learns IPv4-to-MAC bindings from every ARP frame it sees and answers
//! requests straight out of the cache, so resolution of a known host never
//! has to flood the overlay. Synthetic replies go into the local tap only.

use crate::frame::{EthernetFrame, Mac, ETHERNET_HEADER_SIZE, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use log::debug;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// ARP packet body length for IPv4 over Ethernet.
pub const ARP_PACKET_SIZE: usize = 28;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// Cache entries expire after this long without refresh.
pub const ARP_CACHE_EXPIRY: Duration = Duration::from_secs(300);

/// Upper bound on cache size.
pub const ARP_CACHE_MAX: usize = 1024;

/// A parsed IPv4/Ethernet ARP packet. Anything else fails to parse and is
/// left alone for the switch to forward.
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: Mac,
    pub sender_ip: [u8; 4],
    pub target_ip: [u8; 4],
}

impl ArpPacket {
    pub fn parse(payload: &[u8]) -> Option<ArpPacket> {
        if payload.len() < ARP_PACKET_SIZE {
            return None;
        }
        let htype = u16::from_be_bytes([payload[0], payload[1]]);
        let ptype = u16::from_be_bytes([payload[2], payload[3]]);
        let hlen = payload[4];
        let plen = payload[5];
        if htype != 1 || ptype != ETHERTYPE_IPV4 || hlen != 6 || plen != 4 {
            return None;
        }
        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&payload[8..14]);
        let mut sender_ip = [0u8; 4];
        sender_ip.copy_from_slice(&payload[14..18]);
        let mut target_ip = [0u8; 4];
        target_ip.copy_from_slice(&payload[24..28]);
        Some(ArpPacket {
            operation: u16::from_be_bytes([payload[6], payload[7]]),
            sender_mac,
            sender_ip,
            target_ip,
        })
    }
}

struct ArpEntry {
    mac: Mac,
    last_seen: Instant,
}

/// Per-network ARP cache and request short-circuit.
pub struct ArpProxy {
    cache: RwLock<HashMap<[u8; 4], ArpEntry>>,
}

impl ArpProxy {
    pub fn new() -> Self {
        ArpProxy {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Handles an ARP frame from the local tap. Always learns the sender
    /// binding; for a request with a fresh cached answer, returns a
    /// synthetic reply frame to inject back into the tap. `None` means
    /// the frame should take the normal switch path.
    pub fn handle_frame(&self, frame: &EthernetFrame<'_>) -> Option<Vec<u8>> {
        let arp = ArpPacket::parse(frame.payload())?;
        self.learn(arp.sender_ip, arp.sender_mac);

        if arp.operation != ARP_REQUEST {
            return None;
        }

        let target_mac = self.lookup_fresh(&arp.target_ip)?;
        debug!(
            "arp proxy hit: {} is {}",
            Ipv4Addr::from(arp.target_ip),
            crate::frame::format_mac(&target_mac)
        );
        Some(build_reply(
            &arp.sender_mac,
            &arp.sender_ip,
            &target_mac,
            &arp.target_ip,
        ))
    }

    /// Learns from an ARP frame without answering. Used on the remote
    /// ingress path, where frames are injected rather than proxied.
    pub fn observe(&self, frame: &EthernetFrame<'_>) {
        if let Some(arp) = ArpPacket::parse(frame.payload()) {
            self.learn(arp.sender_ip, arp.sender_mac);
        }
    }

    fn learn(&self, ip: [u8; 4], mac: Mac) {
        let mut cache = self.cache.write().expect("arp cache lock poisoned");
        if cache.len() >= ARP_CACHE_MAX && !cache.contains_key(&ip) {
            Self::evict_oldest(&mut cache);
        }
        cache.insert(
            ip,
            ArpEntry {
                mac,
                last_seen: Instant::now(),
            },
        );
    }

    fn lookup_fresh(&self, ip: &[u8; 4]) -> Option<Mac> {
        let cache = self.cache.read().expect("arp cache lock poisoned");
        let entry = cache.get(ip)?;
        if entry.last_seen.elapsed() < ARP_CACHE_EXPIRY {
            Some(entry.mac)
        } else {
            None
        }
    }

    fn evict_oldest(cache: &mut HashMap<[u8; 4], ArpEntry>) {
        let oldest = cache
            .iter()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(ip, _)| *ip);
        if let Some(ip) = oldest {
            cache.remove(&ip);
        }
    }

    /// Expires entries older than `max_age`.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut cache = self.cache.write().expect("arp cache lock poisoned");
        let before = cache.len();
        cache.retain(|_, e| e.last_seen.elapsed() < max_age);
        before - cache.len()
    }

    pub fn len(&self) -> usize {
        self.cache.read().expect("arp cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ArpProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the synthetic reply: Ethernet destination is the requester,
/// source is the resolved MAC; ARP sender fields carry the resolved
/// binding, target fields the requester's.
fn build_reply(
    requester_mac: &Mac,
    requester_ip: &[u8; 4],
    target_mac: &Mac,
    target_ip: &[u8; 4],
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE];
    frame[0..6].copy_from_slice(requester_mac);
    frame[6..12].copy_from_slice(target_mac);
    frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());

    let arp = &mut frame[ETHERNET_HEADER_SIZE..];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&ARP_REPLY.to_be_bytes());
    arp[8..14].copy_from_slice(target_mac);
    arp[14..18].copy_from_slice(target_ip);
    arp[18..24].copy_from_slice(requester_mac);
    arp[24..28].copy_from_slice(requester_ip);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EthernetFrame;

    fn arp_frame(operation: u16, sender_mac: Mac, sender_ip: [u8; 4], target_ip: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&sender_mac);
        frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
        let arp = &mut frame[ETHERNET_HEADER_SIZE..];
        arp[0..2].copy_from_slice(&1u16.to_be_bytes());
        arp[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&operation.to_be_bytes());
        arp[8..14].copy_from_slice(&sender_mac);
        arp[14..18].copy_from_slice(&sender_ip);
        arp[24..28].copy_from_slice(&target_ip);
        frame
    }

    const REQUESTER_MAC: Mac = [0x02, 0, 0, 0x0a, 0x0b, 0x0c];
    const REQUESTER_IP: [u8; 4] = [10, 147, 17, 1];
    const TARGET_MAC: Mac = [0x02, 0, 0, 0x0d, 0x0e, 0x0f];
    const TARGET_IP: [u8; 4] = [10, 147, 17, 2];

    #[test]
    fn test_request_miss_returns_none_but_learns_sender() {
        let proxy = ArpProxy::new();
        let raw = arp_frame(ARP_REQUEST, REQUESTER_MAC, REQUESTER_IP, TARGET_IP);
        let frame = EthernetFrame::parse(&raw).unwrap();
        assert!(proxy.handle_frame(&frame).is_none());
        assert_eq!(proxy.len(), 1);
        assert_eq!(proxy.lookup_fresh(&REQUESTER_IP), Some(REQUESTER_MAC));
    }

    #[test]
    fn test_request_hit_builds_correct_reply() {
        let proxy = ArpProxy::new();
        // seed the cache via a gratuitous announcement from the target
        let seed = arp_frame(ARP_REPLY, TARGET_MAC, TARGET_IP, REQUESTER_IP);
        let answered = proxy.handle_frame(&EthernetFrame::parse(&seed).unwrap());
        assert!(answered.is_none(), "replies must not be answered");

        let raw = arp_frame(ARP_REQUEST, REQUESTER_MAC, REQUESTER_IP, TARGET_IP);
        let reply = proxy
            .handle_frame(&EthernetFrame::parse(&raw).unwrap())
            .expect("cache hit should synthesize a reply");

        let parsed = EthernetFrame::parse(&reply).unwrap();
        assert_eq!(parsed.dst_mac(), REQUESTER_MAC);
        assert_eq!(parsed.src_mac(), TARGET_MAC);
        assert_eq!(parsed.ethertype(), ETHERTYPE_ARP);

        let arp = ArpPacket::parse(parsed.payload()).unwrap();
        assert_eq!(arp.operation, ARP_REPLY);
        assert_eq!(arp.sender_mac, TARGET_MAC);
        assert_eq!(arp.sender_ip, TARGET_IP);
        assert_eq!(arp.target_ip, REQUESTER_IP);
        assert_eq!(&parsed.payload()[18..24], &REQUESTER_MAC);
    }

    #[test]
    fn test_non_ipv4_arp_ignored() {
        let proxy = ArpProxy::new();
        let mut raw = arp_frame(ARP_REQUEST, REQUESTER_MAC, REQUESTER_IP, TARGET_IP);
        // hardware type 6 (IEEE 802)
        raw[ETHERNET_HEADER_SIZE + 1] = 6;
        let frame = EthernetFrame::parse(&raw).unwrap();
        assert!(proxy.handle_frame(&frame).is_none());
        assert!(proxy.is_empty());
    }

    #[test]
    fn test_truncated_arp_ignored() {
        let proxy = ArpProxy::new();
        let raw = arp_frame(ARP_REQUEST, REQUESTER_MAC, REQUESTER_IP, TARGET_IP);
        let frame = EthernetFrame::parse(&raw[..ETHERNET_HEADER_SIZE + 27]).unwrap();
        assert!(proxy.handle_frame(&frame).is_none());
        assert!(proxy.is_empty());
    }

    #[test]
    fn test_observe_learns_without_answering() {
        let proxy = ArpProxy::new();
        let raw = arp_frame(ARP_REPLY, TARGET_MAC, TARGET_IP, REQUESTER_IP);
        proxy.observe(&EthernetFrame::parse(&raw).unwrap());
        assert_eq!(proxy.lookup_fresh(&TARGET_IP), Some(TARGET_MAC));
    }

    #[test]
    fn test_sweep_expires_entries() {
        let proxy = ArpProxy::new();
        let raw = arp_frame(ARP_REPLY, TARGET_MAC, TARGET_IP, REQUESTER_IP);
        proxy.observe(&EthernetFrame::parse(&raw).unwrap());
        assert_eq!(proxy.sweep_older_than(Duration::ZERO), 1);
        assert!(proxy.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let proxy = ArpProxy::new();
        proxy.learn([0, 0, 0, 0], [1; 6]);
        std::thread::sleep(Duration::from_millis(5));
        for i in 1..ARP_CACHE_MAX as u32 {
            proxy.learn(i.to_be_bytes(), [2; 6]);
        }
        assert_eq!(proxy.len(), ARP_CACHE_MAX);
        proxy.learn([9, 9, 9, 9], [3; 6]);
        assert_eq!(proxy.len(), ARP_CACHE_MAX);
        assert_eq!(proxy.lookup_fresh(&[0, 0, 0, 0]), None);
    }
}
