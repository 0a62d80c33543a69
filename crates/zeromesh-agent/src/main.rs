use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use zeromesh_agent::config::{
    parse_peer_specs, parse_psk_hex, AgentConfig, DEFAULT_IDENTITY_PATH, DEFAULT_TAP_NAME,
};
use zeromesh_agent::{http, Agent, Identity};
use zeromesh_proto::{DEFAULT_MTU, DEFAULT_UDP_PORT};

#[derive(Parser, Debug)]
#[command(
    name = "zeromesh-agent",
    version,
    about = "ZeroMesh agent - encrypted virtual Layer-2 overlay",
    long_about = "ZeroMesh agent\n\n\
        Presents a kernel tap device on this host and carries its Ethernet\n\
        frames, encrypted, over UDP to the other members of the same virtual\n\
        network.\n\n\
        Examples:\n  \
          # static two-node network\n  \
          zeromesh-agent --psk <64 hex chars> --tap-ip 10.147.17.1/24 \\\n      \
              --peer <pubkey>@peer.example.org:9993\n\n  \
          # controller-managed\n  \
          zeromesh-agent --controller ws://controller.example.org:9394"
)]
struct Args {
    /// Path to the identity key file
    #[arg(long, default_value = DEFAULT_IDENTITY_PATH)]
    identity: PathBuf,

    /// UDP listen port for the overlay transport
    #[arg(short, long, default_value_t = DEFAULT_UDP_PORT)]
    port: u16,

    /// Tap device name
    #[arg(long, default_value = DEFAULT_TAP_NAME)]
    tap: String,

    /// IP/mask to assign to the tap (e.g. 10.147.17.1/24)
    #[arg(long)]
    tap_ip: Option<String>,

    /// Tap device MTU
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u16,

    /// Network id
    #[arg(long, default_value_t = 1)]
    network: u32,

    /// Pre-shared key (hex, 64 chars)
    #[arg(long)]
    psk: Option<String>,

    /// Static peer list: pubkey@host:port[,pubkey@host:port]
    #[arg(long)]
    peer: Option<String>,

    /// Controller URL (ws://host:port)
    #[arg(long)]
    controller: Option<String>,

    /// Port for the local metrics/introspection endpoint (0 = disabled)
    #[arg(long, default_value_t = 0)]
    metrics_port: u16,

    /// Log level: debug, info, warn, error
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the node address and public key, then exit
    #[arg(long)]
    show_identity: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.as_str()),
    )
    .init();

    let mut config = AgentConfig {
        identity_path: args.identity,
        listen_port: args.port,
        tap_name: args.tap,
        tap_ipv4: args.tap_ip,
        tap_mtu: args.mtu,
        network_id: args.network,
        controller_url: args.controller,
        metrics_port: args.metrics_port,
        ..AgentConfig::default()
    };
    if let Some(psk) = &args.psk {
        config.psk = parse_psk_hex(psk)?;
    }
    if let Some(peers) = &args.peer {
        config.static_peers = parse_peer_specs(peers)?;
    }

    if args.show_identity {
        let identity = Identity::load_or_generate(&config.identity_path)?;
        println!("Address:    {}", identity.address);
        println!("Public Key: {}", identity.public_key_hex());
        return Ok(());
    }

    let metrics_port = config.metrics_port;
    let agent = Agent::new(config).await?;
    agent.start().await?;

    if metrics_port != 0 {
        let metrics = agent.metrics();
        let peers = agent.peers().clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(metrics, peers, metrics_port).await {
                log::error!("introspection endpoint failed: {:#}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("received interrupt, shutting down");
    agent.stop().await;
    Ok(())
}
