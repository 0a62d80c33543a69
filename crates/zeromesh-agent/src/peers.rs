//! Peer records and the peer table.
//!
//! Peers are keyed by their 5-byte node address; the table also keeps an
//! endpoint index for the inbound fast path. Table mutations take the one
//! table lock; per-peer fields have their own synchronization so the hot
//! path never serializes on the table.

use crate::error::{CipherError, SendError};
use crate::identity::Address;
use crate::noise::TransportCipher;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// How often to send keepalive packets on a quiet link.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A peer is considered alive this long after the last inbound datagram.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Dead peers linger this long before the maintenance sweep drops them.
pub const DEAD_RETENTION: Duration = Duration::from_secs(300);

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    New,
    Handshaking,
    Connected,
    Dead,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::New => "new",
            PeerState::Handshaking => "handshaking",
            PeerState::Connected => "connected",
            PeerState::Dead => "dead",
        };
        f.write_str(name)
    }
}

struct PeerMeta {
    endpoint: SocketAddr,
    state: PeerState,
    last_seen: Instant,
    last_send: Instant,
    hello_sent_to: Option<SocketAddr>,
    latency_ms: i64,
    bytes_sent: u64,
    bytes_recv: u64,
}

/// A remote node we exchange datagrams with.
pub struct Peer {
    pub address: Address,
    pub public_key: [u8; 32],
    meta: RwLock<PeerMeta>,
    cipher: RwLock<Option<Arc<TransportCipher>>>,
}

/// Point-in-time view of a peer, for status reports and introspection.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub address: String,
    pub endpoint: String,
    pub state: PeerState,
    pub latency_ms: i64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

impl Peer {
    fn new(address: Address, public_key: [u8; 32], endpoint: SocketAddr) -> Self {
        let now = Instant::now();
        Peer {
            address,
            public_key,
            meta: RwLock::new(PeerMeta {
                endpoint,
                state: PeerState::New,
                last_seen: now,
                last_send: now,
                hello_sent_to: None,
                latency_ms: 0,
                bytes_sent: 0,
                bytes_recv: 0,
            }),
            cipher: RwLock::new(None),
        }
    }

    fn meta(&self) -> std::sync::RwLockReadGuard<'_, PeerMeta> {
        self.meta.read().expect("peer lock poisoned")
    }

    fn meta_mut(&self) -> std::sync::RwLockWriteGuard<'_, PeerMeta> {
        self.meta.write().expect("peer lock poisoned")
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.meta().endpoint
    }

    pub fn state(&self) -> PeerState {
        self.meta().state
    }

    /// Installs the transport cipher and marks the peer connected. If a
    /// cipher is already present it is kept: the keys are deterministic for
    /// the pair, and replacing the cipher would reset the send counter and
    /// reuse nonces.
    pub fn connect_with(&self, cipher: TransportCipher) {
        {
            let mut slot = self.cipher.write().expect("peer lock poisoned");
            if slot.is_none() {
                *slot = Some(Arc::new(cipher));
            }
        }
        let mut meta = self.meta_mut();
        meta.state = PeerState::Connected;
        meta.last_seen = Instant::now();
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
            && self.cipher.read().expect("peer lock poisoned").is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.meta().last_seen.elapsed() < PEER_TIMEOUT
    }

    pub fn mark_dead(&self) {
        self.meta_mut().state = PeerState::Dead;
    }

    /// Records an inbound datagram from this peer.
    pub fn touch(&self) {
        self.meta_mut().last_seen = Instant::now();
    }

    /// Records an outbound datagram to this peer.
    pub fn mark_send(&self) {
        self.meta_mut().last_send = Instant::now();
    }

    pub fn needs_keepalive(&self) -> bool {
        let meta = self.meta();
        meta.state == PeerState::Connected && meta.last_send.elapsed() >= KEEPALIVE_INTERVAL
    }

    /// Whether we still owe this peer a hello at its current endpoint.
    /// Hellos are idempotent, so this only suppresses duplicates.
    pub fn needs_hello(&self, endpoint: SocketAddr) -> bool {
        self.meta().hello_sent_to != Some(endpoint)
    }

    pub fn record_hello_sent(&self, endpoint: SocketAddr) {
        let mut meta = self.meta_mut();
        meta.hello_sent_to = Some(endpoint);
        meta.last_send = Instant::now();
        if meta.state == PeerState::New {
            meta.state = PeerState::Handshaking;
        }
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.meta_mut().bytes_sent += n;
    }

    pub fn add_bytes_recv(&self, n: u64) {
        self.meta_mut().bytes_recv += n;
    }

    pub fn encrypt(&self, frame: &[u8]) -> Result<Vec<u8>, SendError> {
        let cipher = self.cipher.read().expect("peer lock poisoned");
        match cipher.as_ref() {
            Some(c) => c.encrypt(frame).map_err(|_| SendError::Encryption),
            None => Err(SendError::NotConnected(self.address)),
        }
    }

    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CipherError> {
        let cipher = self.cipher.read().expect("peer lock poisoned");
        match cipher.as_ref() {
            Some(c) => c.decrypt(payload),
            None => Err(CipherError::NoCipher),
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let meta = self.meta();
        PeerSnapshot {
            address: self.address.to_string(),
            endpoint: meta.endpoint.to_string(),
            state: meta.state,
            latency_ms: meta.latency_ms,
            bytes_sent: meta.bytes_sent,
            bytes_recv: meta.bytes_recv,
        }
    }

    fn dead_past_retention(&self) -> bool {
        let meta = self.meta();
        meta.state == PeerState::Dead && meta.last_seen.elapsed() > DEAD_RETENTION
    }
}

struct Tables {
    by_addr: HashMap<Address, Arc<Peer>>,
    by_endpoint: HashMap<SocketAddr, Address>,
}

/// All known peers, with an endpoint index for the inbound fast path.
pub struct PeerTable {
    inner: RwLock<Tables>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            inner: RwLock::new(Tables {
                by_addr: HashMap::new(),
                by_endpoint: HashMap::new(),
            }),
        }
    }

    /// Adds a peer or refreshes an existing one's endpoint. Returns `None`
    /// when the address is already bound to a different public key: a
    /// colliding hello must not silently replace keys or endpoint.
    pub fn add_or_refresh(
        &self,
        address: Address,
        public_key: [u8; 32],
        endpoint: SocketAddr,
    ) -> Option<Arc<Peer>> {
        let mut tables = self.inner.write().expect("peer table lock poisoned");
        if let Some(existing) = tables.by_addr.get(&address).cloned() {
            if existing.public_key != public_key {
                warn!(
                    "public key mismatch for peer {}: refusing endpoint update from {}",
                    address, endpoint
                );
                return None;
            }
            let old = existing.endpoint();
            if old != endpoint {
                tables.by_endpoint.remove(&old);
                tables.by_endpoint.insert(endpoint, address);
                existing.meta_mut().endpoint = endpoint;
                info!("peer {} endpoint moved {} -> {}", address, old, endpoint);
            }
            return Some(existing);
        }

        let peer = Arc::new(Peer::new(address, public_key, endpoint));
        tables.by_addr.insert(address, peer.clone());
        tables.by_endpoint.insert(endpoint, address);
        info!("peer {} added (endpoint {})", address, endpoint);
        Some(peer)
    }

    pub fn get(&self, address: &Address) -> Option<Arc<Peer>> {
        self.inner
            .read()
            .expect("peer table lock poisoned")
            .by_addr
            .get(address)
            .cloned()
    }

    pub fn get_by_endpoint(&self, endpoint: &SocketAddr) -> Option<Arc<Peer>> {
        let tables = self.inner.read().expect("peer table lock poisoned");
        let address = tables.by_endpoint.get(endpoint)?;
        tables.by_addr.get(address).cloned()
    }

    pub fn remove(&self, address: &Address) -> Option<Arc<Peer>> {
        let mut tables = self.inner.write().expect("peer table lock poisoned");
        let peer = tables.by_addr.remove(address)?;
        tables.by_endpoint.remove(&peer.endpoint());
        info!("peer {} removed", address);
        Some(peer)
    }

    pub fn connected(&self) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .expect("peer table lock poisoned")
            .by_addr
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .expect("peer table lock poisoned")
            .by_addr
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("peer table lock poisoned")
            .by_addr
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops peers that have been dead longer than the retention window.
    pub fn prune_dead(&self) -> usize {
        let stale: Vec<Address> = self
            .all()
            .into_iter()
            .filter(|p| p.dead_past_retention())
            .map(|p| p.address)
            .collect();
        for address in &stale {
            self.remove(address);
        }
        stale.len()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise::{derive_keys_from_psk, TransportCipher};

    fn addr(n: u8) -> Address {
        Address::from_public_key(&[n; 32])
    }

    fn ep(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_add_and_lookup() {
        let table = PeerTable::new();
        let a = addr(1);
        let peer = table.add_or_refresh(a, [1; 32], ep(9001)).unwrap();
        assert_eq!(peer.state(), PeerState::New);
        assert_eq!(table.get(&a).unwrap().address, a);
        assert_eq!(table.get_by_endpoint(&ep(9001)).unwrap().address, a);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_endpoint_migration_updates_index() {
        let table = PeerTable::new();
        let a = addr(1);
        table.add_or_refresh(a, [1; 32], ep(9001)).unwrap();
        table.add_or_refresh(a, [1; 32], ep(9002)).unwrap();
        assert!(table.get_by_endpoint(&ep(9001)).is_none());
        assert_eq!(table.get_by_endpoint(&ep(9002)).unwrap().address, a);
        assert_eq!(table.get(&a).unwrap().endpoint(), ep(9002));
    }

    #[test]
    fn test_key_mismatch_refused() {
        let table = PeerTable::new();
        let a = addr(1);
        table.add_or_refresh(a, [1; 32], ep(9001)).unwrap();
        assert!(table.add_or_refresh(a, [2; 32], ep(9002)).is_none());
        // original binding untouched
        assert_eq!(table.get(&a).unwrap().endpoint(), ep(9001));
        assert_eq!(table.get(&a).unwrap().public_key, [1; 32]);
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let table = PeerTable::new();
        let a = addr(1);
        table.add_or_refresh(a, [1; 32], ep(9001)).unwrap();
        assert!(table.remove(&a).is_some());
        assert!(table.get(&a).is_none());
        assert!(table.get_by_endpoint(&ep(9001)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_connect_requires_cipher() {
        let table = PeerTable::new();
        let peer = table.add_or_refresh(addr(1), [1; 32], ep(9001)).unwrap();
        assert!(!peer.is_connected());
        assert!(matches!(
            peer.encrypt(b"frame"),
            Err(SendError::NotConnected(_))
        ));

        let (send, recv) = derive_keys_from_psk(&[0; 32], &[1; 32], &[2; 32]);
        peer.connect_with(TransportCipher::new(&send, &recv));
        assert!(peer.is_connected());
        assert!(peer.encrypt(b"frame").is_ok());
    }

    #[test]
    fn test_reconnect_keeps_cipher_counter() {
        let table = PeerTable::new();
        let peer = table.add_or_refresh(addr(1), [1; 32], ep(9001)).unwrap();
        let (send, recv) = derive_keys_from_psk(&[0; 32], &[1; 32], &[2; 32]);
        peer.connect_with(TransportCipher::new(&send, &recv));

        let first = peer.encrypt(b"x").unwrap();
        assert_eq!(u64::from_le_bytes(first[..8].try_into().unwrap()), 0);

        peer.mark_dead();
        peer.connect_with(TransportCipher::new(&send, &recv));
        let second = peer.encrypt(b"x").unwrap();
        // counter continues, never reused with the same key
        assert_eq!(u64::from_le_bytes(second[..8].try_into().unwrap()), 1);
    }

    #[test]
    fn test_hello_bookkeeping() {
        let table = PeerTable::new();
        let peer = table.add_or_refresh(addr(1), [1; 32], ep(9001)).unwrap();
        assert!(peer.needs_hello(ep(9001)));
        peer.record_hello_sent(ep(9001));
        assert!(!peer.needs_hello(ep(9001)));
        assert_eq!(peer.state(), PeerState::Handshaking);
        // an endpoint change owes a fresh hello
        assert!(peer.needs_hello(ep(9002)));
    }

    #[test]
    fn test_connected_snapshot_filters() {
        let table = PeerTable::new();
        let p1 = table.add_or_refresh(addr(1), [1; 32], ep(9001)).unwrap();
        table.add_or_refresh(addr(2), [2; 32], ep(9002)).unwrap();
        let (send, recv) = derive_keys_from_psk(&[0; 32], &[1; 32], &[3; 32]);
        p1.connect_with(TransportCipher::new(&send, &recv));
        assert_eq!(table.connected().len(), 1);
        assert_eq!(table.all().len(), 2);
    }
}
