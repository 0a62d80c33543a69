//! The agent orchestrator.
//!
//! Owns the UDP transport, the peer table, the tap device, and the
//! per-network switch, and runs the long-lived loops: tap reader, UDP
//! reader, and the periodic maintenance tick. In controlled mode the tap
//! is deferred until the controller pushes a network descriptor.

use crate::config::AgentConfig;
use crate::error::{CipherError, SendError};
use crate::frame::{format_mac, EthernetFrame, ETHERNET_HEADER_SIZE, MIN_FRAME_SIZE};
use crate::identity::{Address, Identity};
use crate::metrics::Metrics;
use crate::network::{clamp_mtu, Network, NetworkDescriptor};
use crate::noise::{derive_keys_from_psk, TransportCipher, CIPHER_OVERHEAD};
use crate::packet::{Packet, PacketKind, HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
use crate::peers::{Peer, PeerState, PeerTable};
use crate::switch::{PeerSender, MAC_TABLE_EXPIRY};
use crate::tap::{TapDevice, TapReader, TAP_BUFFER_SIZE};
use crate::transport::UdpTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use zeromesh_proto::{ControlMessage, PeerStatus};

/// Cadence of the periodic maintenance tick.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// The `PeerSender` capability handed to each switch: encrypt-and-emit
/// over the transport, addressed through the peer table. The switch never
/// sees the socket and nothing here points back at the agent.
pub(crate) struct PeerLinks {
    transport: Arc<UdpTransport>,
    peers: Arc<PeerTable>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl PeerSender for PeerLinks {
    async fn send_to_peer(
        &self,
        peer_addr: Address,
        network_id: u32,
        frame: &[u8],
    ) -> Result<(), SendError> {
        if frame.len() + CIPHER_OVERHEAD > MAX_PAYLOAD_SIZE {
            return Err(SendError::FrameTooLarge(frame.len()));
        }
        let peer = self
            .peers
            .get(&peer_addr)
            .ok_or(SendError::UnknownPeer(peer_addr))?;
        if !peer.is_connected() {
            return Err(SendError::NotConnected(peer_addr));
        }
        let payload = peer.encrypt(frame)?;
        self.transport
            .send_packet(&Packet::data(network_id, payload), peer.endpoint())
            .await?;
        peer.mark_send();
        peer.add_bytes_sent(frame.len() as u64);
        self.metrics.inc_packets_tx();
        Ok(())
    }

    async fn broadcast(
        &self,
        network_id: u32,
        frame: &[u8],
        except: Option<Address>,
    ) -> Result<(), SendError> {
        for peer in self.peers.connected() {
            if except == Some(peer.address) {
                continue;
            }
            if let Err(e) = self.send_to_peer(peer.address, network_id, frame).await {
                debug!("broadcast to {} failed: {}", peer.address, e);
            }
        }
        Ok(())
    }
}

pub struct Agent {
    config: AgentConfig,
    identity: Identity,
    transport: Arc<UdpTransport>,
    peers: Arc<PeerTable>,
    links: Arc<PeerLinks>,
    metrics: Arc<Metrics>,
    psk: RwLock<[u8; 32]>,
    network: RwLock<Option<Arc<Network>>>,
    tap_writer: Mutex<Option<crate::tap::TapWriter>>,
    controller_tx: RwLock<Option<mpsc::UnboundedSender<ControlMessage>>>,
    reflexive_endpoint: RwLock<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Loads the identity and binds the overlay socket. Nothing runs until
    /// [`Agent::start`].
    pub async fn new(config: AgentConfig) -> Result<Arc<Self>> {
        let identity = Identity::load_or_generate(&config.identity_path)
            .context("load identity")?;
        info!(
            "identity {} (pubkey {}...)",
            identity.address,
            &identity.public_key_hex()[..16]
        );

        let transport = Arc::new(UdpTransport::bind(config.listen_port).await?);
        let peers = Arc::new(PeerTable::new());
        let metrics = Metrics::new();
        let links = Arc::new(PeerLinks {
            transport: transport.clone(),
            peers: peers.clone(),
            metrics: metrics.clone(),
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Agent {
            psk: RwLock::new(config.psk),
            identity,
            transport,
            peers,
            links,
            metrics,
            network: RwLock::new(None),
            tap_writer: Mutex::new(None),
            controller_tx: RwLock::new(None),
            reflexive_endpoint: RwLock::new(None),
            shutdown,
            tasks: StdMutex::new(Vec::new()),
            config,
        }))
    }

    /// Starts the long-running tasks. In static mode the tap comes up
    /// immediately and configured peers get an eager hello; in controlled
    /// mode the tap waits for the controller's `network_config`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.spawn(Self::udp_read_loop(self.clone()));
        self.spawn(Self::maintenance_loop(self.clone()));
        self.spawn(Self::stun_discovery(self.clone()));

        match self.config.controller_url.clone() {
            Some(url) => {
                self.spawn(crate::controller::run(self.clone(), url.clone()));
                info!(
                    "agent started in controlled mode (address {}, udp/{}, controller {})",
                    self.identity.address,
                    self.transport.port(),
                    url
                );
            }
            None => {
                let descriptor = NetworkDescriptor {
                    id: self.config.network_id,
                    name: "default".to_string(),
                    ip_range: String::new(),
                    mtu: self.config.tap_mtu,
                    multicast: true,
                };
                self.setup_network(descriptor, self.config.tap_ipv4.clone())
                    .await?;
                for sp in &self.config.static_peers {
                    self.install_peer(sp.public_key, sp.endpoint).await;
                }
                info!(
                    "agent started (address {}, udp/{}, {} static peers)",
                    self.identity.address,
                    self.transport.port(),
                    self.config.static_peers.len()
                );
            }
        }
        Ok(())
    }

    /// Signals every task to stop and waits for them on a join barrier.
    pub async fn stop(&self) {
        info!("agent stopping");
        // best-effort leave so the controller can mark us offline promptly
        let tx = self
            .controller_tx
            .read()
            .expect("controller tx lock poisoned")
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(ControlMessage::Leave {
                networks: self.requested_networks(),
            });
        }
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("agent stopped");
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .push(tokio::spawn(fut));
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn network(&self) -> Option<Arc<Network>> {
        self.network.read().expect("network lock poisoned").clone()
    }

    pub fn set_psk(&self, psk: [u8; 32]) {
        *self.psk.write().expect("psk lock poisoned") = psk;
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn set_controller_tx(&self, tx: Option<mpsc::UnboundedSender<ControlMessage>>) {
        *self
            .controller_tx
            .write()
            .expect("controller tx lock poisoned") = tx;
    }

    pub fn reflexive_endpoint(&self) -> Option<SocketAddr> {
        *self
            .reflexive_endpoint
            .read()
            .expect("reflexive endpoint lock poisoned")
    }

    /// Network ids requested in the `join` message.
    pub fn requested_networks(&self) -> Vec<String> {
        vec![self.config.network_id.to_string()]
    }

    /// Local endpoints reported in the `join` message: the bound port plus
    /// the STUN-discovered reflexive endpoint once known.
    pub fn observed_endpoints(&self) -> Vec<String> {
        let mut endpoints = vec![format!(":{}", self.port())];
        if let Some(addr) = self.reflexive_endpoint() {
            endpoints.push(addr.to_string());
        }
        endpoints
    }

    /// Creates the tap, applies MTU/MAC/address, instantiates the switch
    /// for the network, and starts the tap read loop. Idempotent: a second
    /// descriptor for an already-configured agent only logs.
    pub async fn setup_network(
        self: &Arc<Self>,
        descriptor: NetworkDescriptor,
        assigned_ip: Option<String>,
    ) -> Result<()> {
        if self.network().is_some() {
            debug!("network already configured, ignoring descriptor");
            return Ok(());
        }

        let mtu = clamp_mtu(descriptor.mtu);
        let descriptor = NetworkDescriptor { mtu, ..descriptor };

        let tap = TapDevice::open(&self.config.tap_name, mtu).context("create tap device")?;

        let network = Arc::new(Network::new(
            descriptor,
            self.identity.address,
            self.links.clone() as Arc<dyn PeerSender>,
        ));

        if let Err(e) = tap.set_mac(&network.local_mac).await {
            warn!("set tap MAC failed: {:#}", e);
        }
        if let Some(cidr) = &assigned_ip {
            match tap.add_address(cidr).await {
                Ok(()) => info!("tap address {} configured", cidr),
                Err(e) => warn!("assign tap address {} failed: {:#}", cidr, e),
            }
        }
        if let Err(e) = tap.set_up().await {
            warn!("bring tap up failed: {:#}", e);
        }

        info!(
            "network {} ('{}') up: tap {} mac {} mtu {} ({} bytes per-frame overlay overhead)",
            network.descriptor.id,
            network.descriptor.name,
            tap.name(),
            format_mac(&network.local_mac),
            mtu,
            HEADER_SIZE + CIPHER_OVERHEAD + ETHERNET_HEADER_SIZE,
        );

        *self.network.write().expect("network lock poisoned") = Some(network);

        let (reader, writer) = tap.split();
        *self.tap_writer.lock().await = Some(writer);
        self.spawn(Self::tap_read_loop(self.clone(), reader));
        Ok(())
    }

    /// Adds (or refreshes) a peer, eagerly derives the PSK session keys,
    /// and sends a hello so the remote side learns our endpoint. Returns
    /// `None` when the peer is refused (address bound to another key).
    pub async fn install_peer(
        self: &Arc<Self>,
        public_key: [u8; 32],
        endpoint: SocketAddr,
    ) -> Option<Arc<Peer>> {
        if public_key == self.identity.public_key {
            debug!("ignoring peer entry for ourselves");
            return None;
        }
        let address = Address::from_public_key(&public_key);
        let peer = self.peers.add_or_refresh(address, public_key, endpoint)?;
        if !peer.is_connected() {
            let psk = *self.psk.read().expect("psk lock poisoned");
            let (send_key, recv_key) =
                derive_keys_from_psk(&psk, &self.identity.public_key, &public_key);
            peer.connect_with(TransportCipher::new(&send_key, &recv_key));
            info!("peer {} connected (PSK session, endpoint {})", address, endpoint);
        }
        self.send_hello(&peer).await;
        Some(peer)
    }

    /// Drops a peer from the table (control-channel eviction). Frames to
    /// MACs learned behind it will fail to send until the entries expire.
    pub fn remove_peer(&self, address: &Address) {
        self.peers.remove(address);
    }

    async fn send_hello(&self, peer: &Peer) {
        let endpoint = peer.endpoint();
        let pkt = Packet::handshake(self.identity.public_key.to_vec());
        match self.transport.send_packet(&pkt, endpoint).await {
            Ok(()) => {
                peer.record_hello_sent(endpoint);
                self.metrics.inc_hellos_tx();
                debug!("hello sent to {} at {}", peer.address, endpoint);
            }
            Err(e) => debug!("hello to {} failed: {}", peer.address, e),
        }
    }

    async fn udp_read_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                result = self.transport.recv_from(&mut buf) => match result {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                    Err(e) => error!("UDP read error: {}", e),
                },
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.metrics.inc_packets_rx();
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                debug!("undecodable datagram from {}: {:#}", from, e);
                return;
            }
        };

        match packet.header.kind {
            PacketKind::Handshake => self.handle_hello(&packet.payload, from).await,
            PacketKind::Data => self.handle_data(&packet, from).await,
            PacketKind::Keepalive => {
                if let Some(peer) = self.peers.get_by_endpoint(&from) {
                    peer.touch();
                }
            }
            PacketKind::Control => debug!("control datagram from {} ignored", from),
        }
    }

    /// Handles a hello: bind the peer to the datagram's source endpoint,
    /// derive keys if this is a new link, and answer with our own hello if
    /// we have not greeted this endpoint yet. Hellos are idempotent and
    /// never rotate keys.
    async fn handle_hello(&self, payload: &[u8], from: SocketAddr) {
        if payload.len() < 32 {
            debug!("short hello ({} bytes) from {}", payload.len(), from);
            return;
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&payload[..32]);
        if public_key == self.identity.public_key {
            return;
        }

        let address = Address::from_public_key(&public_key);
        let Some(peer) = self.peers.add_or_refresh(address, public_key, from) else {
            // address collision with a different key, refused by the table
            return;
        };
        self.metrics.inc_hellos_rx();

        if !peer.is_connected() {
            let psk = *self.psk.read().expect("psk lock poisoned");
            let (send_key, recv_key) =
                derive_keys_from_psk(&psk, &self.identity.public_key, &public_key);
            peer.connect_with(TransportCipher::new(&send_key, &recv_key));
            info!("peer {} connected via hello from {}", address, from);
        }
        peer.touch();

        if peer.needs_hello(from) {
            self.send_hello(&peer).await;
        }
    }

    async fn handle_data(&self, packet: &Packet, from: SocketAddr) {
        let Some(peer) = self.peers.get_by_endpoint(&from) else {
            debug!("data from unknown endpoint {}", from);
            return;
        };
        peer.touch();

        let frame = match peer.decrypt(&packet.payload) {
            Ok(f) => f,
            Err(CipherError::Replay(counter)) => {
                self.metrics.inc_replay_drops();
                debug!("replayed counter {} from {}", counter, peer.address);
                return;
            }
            Err(e) => {
                self.metrics.inc_decrypt_failures();
                debug!("decrypt from {} failed: {}", peer.address, e);
                return;
            }
        };
        peer.add_bytes_recv(frame.len() as u64);

        let Some(network) = self.network() else {
            debug!("no network configured, dropping frame from {}", peer.address);
            return;
        };
        if packet.header.network_id != network.descriptor.id {
            debug!(
                "frame for foreign network {} from {} dropped",
                packet.header.network_id, peer.address
            );
            return;
        }

        // keep the ARP cache warm from transit traffic too
        if let Ok(parsed) = EthernetFrame::parse(&frame) {
            if parsed.is_arp() {
                network.arp.observe(&parsed);
            }
        }

        match network.switch.handle_remote_frame(peer.address, &frame).await {
            Ok(true) => self.inject_frame(&frame).await,
            Ok(false) => {}
            Err(e) => debug!("switch dropped frame from {}: {:#}", peer.address, e),
        }
    }

    async fn inject_frame(&self, frame: &[u8]) {
        let mut writer = self.tap_writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            match writer.write(frame).await {
                Ok(()) => self.metrics.inc_frames_injected(),
                Err(e) => debug!("tap write failed: {}", e),
            }
        }
    }

    async fn tap_read_loop(self: Arc<Self>, mut reader: TapReader) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; TAP_BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                _ = shutdown.changed() => return,
                result = reader.read(&mut buf) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        error!("tap read error: {}", e);
                        return;
                    }
                },
            };
            if n < MIN_FRAME_SIZE {
                continue;
            }
            self.handle_tap_frame(&buf[..n]).await;
        }
    }

    async fn handle_tap_frame(&self, raw: &[u8]) {
        let Some(network) = self.network() else { return };
        let parsed = match EthernetFrame::parse(raw) {
            Ok(f) => f,
            Err(_) => return,
        };

        if parsed.is_arp() {
            if let Some(reply) = network.arp.handle_frame(&parsed) {
                // answered from cache; nothing goes upstream
                self.metrics.inc_arp_proxy_hits();
                self.inject_frame(&reply).await;
                return;
            }
        }

        if let Err(e) = network.switch.handle_local_frame(raw).await {
            debug!("switch handle local frame: {:#}", e);
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.run_maintenance().await,
            }
        }
    }

    async fn run_maintenance(&self) {
        for peer in self.peers.connected() {
            if peer.needs_keepalive() {
                match self
                    .transport
                    .send_packet(&Packet::keepalive(), peer.endpoint())
                    .await
                {
                    Ok(()) => {
                        peer.mark_send();
                        self.metrics.inc_keepalives_tx();
                    }
                    Err(e) => debug!("keepalive to {} failed: {}", peer.address, e),
                }
            }
        }

        for peer in self.peers.all() {
            if peer.state() == PeerState::Connected {
                if !peer.is_alive() {
                    info!("peer {} timed out", peer.address);
                    peer.mark_dead();
                }
                continue;
            }
            // not (or no longer) connected: try again
            self.send_hello(&peer).await;
        }

        if let Some(network) = self.network() {
            network.switch.sweep_older_than(MAC_TABLE_EXPIRY);
            network
                .arp
                .sweep_older_than(crate::arp::ARP_CACHE_EXPIRY);
            self.metrics
                .set_mac_table_entries(network.switch.table_len() as u64);
        }
        self.peers.prune_dead();
        self.metrics
            .set_peers_connected(self.peers.connected().len() as u64);

        self.send_status();
    }

    /// Pushes a `status` message onto the control channel, if connected.
    pub fn send_status(&self) {
        let tx = self
            .controller_tx
            .read()
            .expect("controller tx lock poisoned")
            .clone();
        let Some(tx) = tx else { return };
        let peers: Vec<PeerStatus> = self
            .peers
            .connected()
            .iter()
            .map(|p| {
                let snap = p.snapshot();
                PeerStatus {
                    address: snap.address,
                    latency_ms: snap.latency_ms,
                    path: "direct".to_string(),
                    bytes_sent: snap.bytes_sent as i64,
                    bytes_recv: snap.bytes_recv as i64,
                }
            })
            .collect();
        let _ = tx.send(ControlMessage::Status { peers });
    }

    async fn stun_discovery(self: Arc<Self>) {
        let servers: Vec<String> = crate::stun::STUN_SERVERS
            .iter()
            .map(|s| s.to_string())
            .collect();
        match crate::stun::discover_public_endpoint(&servers).await {
            Ok(addr) => {
                *self
                    .reflexive_endpoint
                    .write()
                    .expect("reflexive endpoint lock poisoned") = Some(addr);
            }
            Err(e) => debug!("STUN discovery failed: {:#}", e),
        }
    }
}
