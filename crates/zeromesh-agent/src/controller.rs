//! Control-channel client.
//!
//! Maintains a WebSocket connection to the controller, announces this node
//! with a `join`, and applies pushed `network_config` and `peer_update`
//! messages. The connection is authenticated out-of-band by two identity
//! headers; those are hints only — the PSK and the peer public keys inside
//! `network_config` are the authority.

use crate::agent::Agent;
use crate::identity::Address;
use crate::network::NetworkDescriptor;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use zeromesh_proto::{
    ControlMessage, PeerAction, PeerInfo, AGENT_CONNECT_PATH, DEFAULT_MTU, HEADER_NODE_ADDRESS,
    HEADER_PUBLIC_KEY,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

enum Session {
    /// Shutdown was requested; do not reconnect.
    Shutdown,
    /// The connection dropped after being established.
    Closed,
}

/// Runs the control-channel loop until shutdown. Reconnects with
/// exponential backoff (5s doubling, capped at 60s); the controller is
/// expected to re-send `network_config` on every reconnect.
pub async fn run(agent: Arc<Agent>, url: String) {
    let mut shutdown = agent.shutdown_rx();
    let mut delay = RECONNECT_DELAY;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let had_session = match connect_and_serve(&agent, &url, &mut shutdown).await {
            Ok(Session::Shutdown) => {
                agent.set_controller_tx(None);
                return;
            }
            Ok(Session::Closed) => true,
            Err(e) => {
                warn!("controller connect failed: {:#} (retry in {:?})", e, delay);
                false
            }
        };
        agent.set_controller_tx(None);
        agent.metrics().inc_controller_reconnects();

        if had_session {
            delay = RECONNECT_DELAY;
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(delay) => {}
        }
        if !had_session {
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }
}

async fn connect_and_serve(
    agent: &Arc<Agent>,
    url: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Session> {
    let endpoint = format!("{}{}", url.trim_end_matches('/'), AGENT_CONNECT_PATH);
    info!("connecting to controller at {}", endpoint);

    let mut request = endpoint
        .as_str()
        .into_client_request()
        .context("build controller request")?;
    request.headers_mut().insert(
        HEADER_NODE_ADDRESS,
        HeaderValue::from_str(&agent.identity().address.to_string())?,
    );
    request.headers_mut().insert(
        HEADER_PUBLIC_KEY,
        HeaderValue::from_str(&agent.identity().public_key_hex())?,
    );

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("dial controller")?;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    agent.set_controller_tx(Some(tx));

    let join = ControlMessage::Join {
        node_addr: agent.identity().address.to_string(),
        public_key: agent.identity().public_key_hex(),
        networks: agent.requested_networks(),
        endpoints: agent.observed_endpoints(),
        platform: std::env::consts::OS.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    sink.send(Message::Text(serde_json::to_string(&join)?))
        .await
        .context("send join")?;
    info!("connected to controller");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // flush anything still queued (e.g. the final leave)
                while let Ok(msg) = rx.try_recv() {
                    if let Ok(text) = serde_json::to_string(&msg) {
                        let _ = sink.send(Message::Text(text)).await;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return Ok(Session::Shutdown);
            }
            outbound = rx.recv() => {
                let Some(msg) = outbound else { return Ok(Session::Closed) };
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        debug!("serialize outbound message: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    warn!("controller connection lost (write)");
                    return Ok(Session::Closed);
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_message(agent, &text).await,
                Some(Ok(Message::Close(_))) | None => {
                    warn!("controller closed the connection");
                    return Ok(Session::Closed);
                }
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    warn!("controller connection lost: {}", e);
                    return Ok(Session::Closed);
                }
            }
        }
    }
}

async fn handle_message(agent: &Arc<Agent>, text: &str) {
    let msg: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("unparseable controller message: {}", e);
            return;
        }
    };

    match msg {
        ControlMessage::NetworkConfig {
            network_id,
            name,
            ip_range,
            mtu,
            multicast,
            psk,
            assigned_ip,
            peers,
            ..
        } => {
            apply_network_config(
                agent, network_id, name, ip_range, mtu, multicast, psk, assigned_ip, peers,
            )
            .await;
        }
        ControlMessage::PeerUpdate { action, peer } => {
            info!("peer update: {:?} {}", action, peer.address);
            match action {
                PeerAction::Add => install_peer_from_info(agent, &peer).await,
                PeerAction::Remove => remove_peer_from_info(agent, &peer),
            }
        }
        ControlMessage::Error { code, message } => {
            warn!("controller error {}: {}", code, message);
        }
        other => debug!("unexpected controller message: {:?}", other),
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_network_config(
    agent: &Arc<Agent>,
    network_id: String,
    name: String,
    ip_range: String,
    mtu: u16,
    multicast: bool,
    psk_hex: String,
    assigned_ip: String,
    peers: Vec<PeerInfo>,
) {
    info!(
        "received network config '{}' (network {}, {} peers, assigned {})",
        name,
        network_id,
        peers.len(),
        assigned_ip
    );

    if !psk_hex.is_empty() {
        match crate::config::parse_psk_hex(&psk_hex) {
            Ok(psk) => agent.set_psk(psk),
            Err(e) => {
                warn!("invalid PSK from controller: {:#}", e);
                return;
            }
        }
    }

    let id = match network_id.parse::<u32>() {
        Ok(id) => id,
        Err(_) => {
            warn!("invalid network id '{}' from controller", network_id);
            return;
        }
    };

    let descriptor = NetworkDescriptor {
        id,
        name,
        ip_range,
        mtu: if mtu == 0 { DEFAULT_MTU } else { mtu },
        multicast,
    };
    let assigned = if assigned_ip.is_empty() {
        None
    } else {
        Some(assigned_ip)
    };

    if let Err(e) = agent.setup_network(descriptor, assigned).await {
        warn!("apply network config failed: {:#}", e);
        return;
    }

    for info in &peers {
        install_peer_from_info(agent, info).await;
    }
}

async fn install_peer_from_info(agent: &Arc<Agent>, info: &PeerInfo) {
    let key_bytes = match hex::decode(&info.public_key) {
        Ok(b) if b.len() == 32 => b,
        _ => {
            warn!("invalid public key for peer {}", info.address);
            return;
        }
    };
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&key_bytes);

    let address = Address::from_public_key(&public_key);
    if let Some(existing) = agent.peers().get(&address) {
        if existing.is_connected() {
            return;
        }
    }

    let mut endpoint = None;
    for candidate in &info.endpoints {
        match tokio::net::lookup_host(candidate.as_str()).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    endpoint = Some(addr);
                    break;
                }
            }
            Err(e) => debug!("resolve endpoint '{}' failed: {}", candidate, e),
        }
    }
    let Some(endpoint) = endpoint else {
        debug!("no usable endpoint for peer {}", info.address);
        return;
    };

    agent.install_peer(public_key, endpoint).await;
}

fn remove_peer_from_info(agent: &Arc<Agent>, info: &PeerInfo) {
    match info.address.parse::<Address>() {
        Ok(address) => agent.remove_peer(&address),
        Err(_) => warn!("invalid peer address '{}' in peer removal", info.address),
    }
}
