//! Virtual Ethernet learning switch, one per network.
//!
//! Every frame teaches the switch where its source MAC lives; destinations
//! are then either injected locally, unicast to one peer, or flooded. The
//! switch reaches the transport only through the [`PeerSender`] capability,
//! supplied by the orchestrator.

use crate::error::SendError;
use crate::frame::{format_mac, EthernetFrame, Mac};
use crate::identity::Address;
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// MAC table entries expire after this long without refresh.
pub const MAC_TABLE_EXPIRY: Duration = Duration::from_secs(300);

/// Upper bound on MAC table size.
pub const MAC_TABLE_MAX: usize = 4096;

/// Where a MAC address was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacLocation {
    /// Behind the local tap.
    Local,
    /// Behind a remote peer.
    Remote(Address),
}

struct MacEntry {
    location: MacLocation,
    last_seen: Instant,
}

/// Capability for emitting frames to remote peers. Implemented by the
/// orchestrator over the transport; the switch never sees the socket.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send_to_peer(
        &self,
        peer: Address,
        network_id: u32,
        frame: &[u8],
    ) -> Result<(), SendError>;

    /// Sends to every connected peer in the network, optionally excluding
    /// one (the ingress peer of a flooded frame). Per-peer failures are
    /// logged, not propagated.
    async fn broadcast(
        &self,
        network_id: u32,
        frame: &[u8],
        except: Option<Address>,
    ) -> Result<(), SendError>;
}

/// A learning switch for one virtual network.
pub struct Switch {
    network_id: u32,
    table: RwLock<HashMap<Mac, MacEntry>>,
    sender: Arc<dyn PeerSender>,
}

impl Switch {
    pub fn new(network_id: u32, sender: Arc<dyn PeerSender>) -> Self {
        Switch {
            network_id,
            table: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Processes a frame read from the local tap: learn the source as
    /// local, then unicast or flood by destination.
    pub async fn handle_local_frame(&self, raw: &[u8]) -> Result<()> {
        let parsed = EthernetFrame::parse(raw)?;
        self.learn(parsed.src_mac(), MacLocation::Local);

        if parsed.is_broadcast() || parsed.is_multicast() {
            self.sender.broadcast(self.network_id, raw, None).await?;
            return Ok(());
        }

        match self.lookup(&parsed.dst_mac()) {
            Some(MacLocation::Remote(peer)) => {
                self.sender.send_to_peer(peer, self.network_id, raw).await?;
            }
            Some(MacLocation::Local) => {
                // would loop straight back onto the tap
            }
            None => {
                debug!(
                    "unknown dst {} on network {}, flooding",
                    format_mac(&parsed.dst_mac()),
                    self.network_id
                );
                self.sender.broadcast(self.network_id, raw, None).await?;
            }
        }
        Ok(())
    }

    /// Processes a decrypted frame received from peer `from`. Returns true
    /// when the frame should be injected into the local tap.
    pub async fn handle_remote_frame(&self, from: Address, raw: &[u8]) -> Result<bool> {
        let parsed = EthernetFrame::parse(raw)?;
        self.learn(parsed.src_mac(), MacLocation::Remote(from));

        if parsed.is_broadcast() || parsed.is_multicast() {
            // re-flood to everyone except the ingress peer, and inject
            if let Err(e) = self
                .sender
                .broadcast(self.network_id, raw, Some(from))
                .await
            {
                debug!("re-flood from {} failed: {}", from, e);
            }
            return Ok(true);
        }

        match self.lookup(&parsed.dst_mac()) {
            Some(MacLocation::Local) => Ok(true),
            Some(MacLocation::Remote(next)) => {
                if let Err(e) = self
                    .sender
                    .send_to_peer(next, self.network_id, raw)
                    .await
                {
                    debug!("forward {} -> {} failed: {}", from, next, e);
                }
                Ok(false)
            }
            None => {
                // might be for us; inject and flood onward
                if let Err(e) = self
                    .sender
                    .broadcast(self.network_id, raw, Some(from))
                    .await
                {
                    debug!("flood from {} failed: {}", from, e);
                }
                Ok(true)
            }
        }
    }

    /// Records where a source MAC lives. A local mapping is only ever set
    /// from the tap side and is never demoted by a remote learn.
    fn learn(&self, mac: Mac, location: MacLocation) {
        let mut table = self.table.write().expect("mac table lock poisoned");
        if let Some(entry) = table.get_mut(&mac) {
            if entry.location == MacLocation::Local && location != MacLocation::Local {
                return;
            }
            entry.location = location;
            entry.last_seen = Instant::now();
            return;
        }
        if table.len() >= MAC_TABLE_MAX {
            Self::evict_oldest(&mut table);
        }
        table.insert(
            mac,
            MacEntry {
                location,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn lookup(&self, mac: &Mac) -> Option<MacLocation> {
        self.table
            .read()
            .expect("mac table lock poisoned")
            .get(mac)
            .map(|e| e.location)
    }

    /// Removes the entry with the oldest last-seen; local entries are
    /// exempt.
    fn evict_oldest(table: &mut HashMap<Mac, MacEntry>) {
        let oldest = table
            .iter()
            .filter(|(_, e)| e.location != MacLocation::Local)
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(mac, _)| *mac);
        if let Some(mac) = oldest {
            table.remove(&mac);
        }
    }

    /// Expires non-local entries older than `max_age`. The maintenance
    /// loop calls this with [`MAC_TABLE_EXPIRY`].
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut table = self.table.write().expect("mac table lock poisoned");
        let before = table.len();
        table.retain(|_, e| e.location == MacLocation::Local || e.last_seen.elapsed() < max_age);
        before - table.len()
    }

    pub fn table_len(&self) -> usize {
        self.table.read().expect("mac table lock poisoned").len()
    }

    pub fn network_id(&self) -> u32 {
        self.network_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ETHERNET_HEADER_SIZE, ETHERTYPE_IPV4};
    use crate::identity::Address;
    use tokio::sync::Mutex;

    const NET: u32 = 7;

    fn addr(n: u8) -> Address {
        Address::from_public_key(&[n; 32])
    }

    fn eth(dst: Mac, src: Mac) -> Vec<u8> {
        let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + 4];
        frame[0..6].copy_from_slice(&dst);
        frame[6..12].copy_from_slice(&src);
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame
    }

    #[derive(Default)]
    struct Recorder {
        unicasts: Mutex<Vec<(Address, Vec<u8>)>>,
        floods: Mutex<Vec<Option<Address>>>,
    }

    #[async_trait]
    impl PeerSender for Recorder {
        async fn send_to_peer(
            &self,
            peer: Address,
            _network_id: u32,
            frame: &[u8],
        ) -> Result<(), SendError> {
            self.unicasts.lock().await.push((peer, frame.to_vec()));
            Ok(())
        }

        async fn broadcast(
            &self,
            _network_id: u32,
            _frame: &[u8],
            except: Option<Address>,
        ) -> Result<(), SendError> {
            self.floods.lock().await.push(except);
            Ok(())
        }
    }

    fn switch_with_recorder() -> (Switch, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (Switch::new(NET, recorder.clone()), recorder)
    }

    #[test]
    fn test_learn_and_lookup() {
        let (sw, _) = switch_with_recorder();
        sw.learn([1; 6], MacLocation::Remote(addr(1)));
        assert_eq!(sw.lookup(&[1; 6]), Some(MacLocation::Remote(addr(1))));
        assert_eq!(sw.lookup(&[2; 6]), None);
    }

    #[test]
    fn test_local_mapping_never_demoted() {
        let (sw, _) = switch_with_recorder();
        sw.learn([1; 6], MacLocation::Local);
        sw.learn([1; 6], MacLocation::Remote(addr(1)));
        assert_eq!(sw.lookup(&[1; 6]), Some(MacLocation::Local));
        // remote mappings do move between peers
        sw.learn([2; 6], MacLocation::Remote(addr(1)));
        sw.learn([2; 6], MacLocation::Remote(addr(2)));
        assert_eq!(sw.lookup(&[2; 6]), Some(MacLocation::Remote(addr(2))));
    }

    #[test]
    fn test_capacity_evicts_oldest_non_local() {
        let (sw, _) = switch_with_recorder();
        sw.learn([0xee; 6], MacLocation::Local);
        let mut first = [0u8; 6];
        first[5] = 1;
        sw.learn(first, MacLocation::Remote(addr(1)));
        // make the first remote entry measurably older than the rest
        std::thread::sleep(Duration::from_millis(5));
        for i in 1..(MAC_TABLE_MAX - 1) {
            let mut mac = [0u8; 6];
            mac[0..4].copy_from_slice(&(i as u32).to_be_bytes());
            mac[5] = 1;
            sw.learn(mac, MacLocation::Remote(addr(1)));
        }
        assert_eq!(sw.table_len(), MAC_TABLE_MAX);

        // the first remote learn is the oldest; one more insert evicts it
        let mut oldest = [0u8; 6];
        oldest[0..4].copy_from_slice(&0u32.to_be_bytes());
        oldest[5] = 1;
        sw.learn([0xdd; 6], MacLocation::Remote(addr(2)));
        assert_eq!(sw.table_len(), MAC_TABLE_MAX);
        assert_eq!(sw.lookup(&oldest), None);
        assert_eq!(sw.lookup(&[0xee; 6]), Some(MacLocation::Local));
    }

    #[test]
    fn test_sweep_spares_local_entries() {
        let (sw, _) = switch_with_recorder();
        sw.learn([1; 6], MacLocation::Local);
        sw.learn([2; 6], MacLocation::Remote(addr(1)));
        let removed = sw.sweep_older_than(Duration::ZERO);
        assert_eq!(removed, 1);
        assert_eq!(sw.lookup(&[1; 6]), Some(MacLocation::Local));
        assert_eq!(sw.lookup(&[2; 6]), None);
    }

    #[tokio::test]
    async fn test_local_broadcast_floods_and_learns() {
        let (sw, rec) = switch_with_recorder();
        sw.handle_local_frame(&eth([0xff; 6], [0x02, 0, 0, 1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(rec.floods.lock().await.as_slice(), &[None]);
        assert_eq!(
            sw.lookup(&[0x02, 0, 0, 1, 2, 3]),
            Some(MacLocation::Local)
        );
    }

    #[tokio::test]
    async fn test_local_unicast_to_known_remote() {
        let (sw, rec) = switch_with_recorder();
        let b = addr(2);
        sw.learn([0x02, 0, 0, 0xd, 0xe, 0xf], MacLocation::Remote(b));

        sw.handle_local_frame(&eth([0x02, 0, 0, 0xd, 0xe, 0xf], [0x02, 0, 0, 0xa, 0xb, 0xc]))
            .await
            .unwrap();

        let unicasts = rec.unicasts.lock().await;
        assert_eq!(unicasts.len(), 1);
        assert_eq!(unicasts[0].0, b);
        assert!(rec.floods.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_unknown_unicast_floods() {
        let (sw, rec) = switch_with_recorder();
        sw.handle_local_frame(&eth([9; 6], [1; 6])).await.unwrap();
        assert_eq!(rec.floods.lock().await.as_slice(), &[None]);
        assert!(rec.unicasts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_local_frame_to_local_mac_dropped() {
        let (sw, rec) = switch_with_recorder();
        sw.learn([9; 6], MacLocation::Local);
        sw.handle_local_frame(&eth([9; 6], [1; 6])).await.unwrap();
        assert!(rec.floods.lock().await.is_empty());
        assert!(rec.unicasts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_broadcast_injects_and_refloods_excluding_sender() {
        let (sw, rec) = switch_with_recorder();
        let p = addr(3);
        let inject = sw
            .handle_remote_frame(p, &eth([0xff; 6], [5; 6]))
            .await
            .unwrap();
        assert!(inject);
        assert_eq!(rec.floods.lock().await.as_slice(), &[Some(p)]);
        assert_eq!(sw.lookup(&[5; 6]), Some(MacLocation::Remote(p)));
    }

    #[tokio::test]
    async fn test_remote_unicast_to_local_injects() {
        let (sw, rec) = switch_with_recorder();
        sw.learn([7; 6], MacLocation::Local);
        let inject = sw
            .handle_remote_frame(addr(3), &eth([7; 6], [5; 6]))
            .await
            .unwrap();
        assert!(inject);
        assert!(rec.floods.lock().await.is_empty());
        assert!(rec.unicasts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_unicast_to_other_remote_forwards_without_inject() {
        let (sw, rec) = switch_with_recorder();
        let p = addr(3);
        let q = addr(4);
        sw.learn([7; 6], MacLocation::Remote(q));
        let inject = sw
            .handle_remote_frame(p, &eth([7; 6], [5; 6]))
            .await
            .unwrap();
        assert!(!inject);
        let unicasts = rec.unicasts.lock().await;
        assert_eq!(unicasts.len(), 1);
        assert_eq!(unicasts[0].0, q);
    }

    #[tokio::test]
    async fn test_remote_unknown_unicast_injects_and_floods() {
        let (sw, rec) = switch_with_recorder();
        let p = addr(3);
        let inject = sw
            .handle_remote_frame(p, &eth([7; 6], [5; 6]))
            .await
            .unwrap();
        assert!(inject);
        assert_eq!(rec.floods.lock().await.as_slice(), &[Some(p)]);
    }

    #[tokio::test]
    async fn test_short_frame_rejected() {
        let (sw, _) = switch_with_recorder();
        assert!(sw.handle_local_frame(&[0u8; 13]).await.is_err());
        assert!(sw.handle_remote_frame(addr(1), &[0u8; 13]).await.is_err());
    }
}
