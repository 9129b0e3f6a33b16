mod cert;
mod manager;
mod proxy;
mod stun;
mod tunnel;
mod turn;
mod wg;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cert::CertManager;
use manager::TunnelManager;
use proxy::TlsSettings;
use stun::{IpFamily, StunServer};
use tunnel::WgTunnelConfig;
use wg::StaticWgIface;

#[derive(Parser)]
#[command(name = "wgmesh-agent", about = "WireGuard mesh connectivity agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the externally visible endpoint and NAT status via STUN
    Probe {
        /// Comma-separated host:port overrides for the STUN server list
        #[arg(long)]
        servers: Option<String>,
        /// Local UDP port to probe; 0 picks an ephemeral port
        #[arg(long, default_value_t = 0)]
        port: u16,
        #[arg(long)]
        ipv6: bool,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Run a TCP tunnel in front of the local WireGuard endpoint
    Tunnel {
        #[arg(long)]
        local_port: u16,
        /// Remote tunnel endpoint, host:port
        #[arg(long)]
        remote: String,
        #[arg(long)]
        tls: bool,
        /// Frame UDP datagrams over the TCP leg
        #[arg(long)]
        udp_over_tcp: bool,
        /// Bind to the WireGuard interface address instead of the wildcard
        #[arg(long)]
        bind_to_wg: bool,
        #[arg(long, default_value = "wg0")]
        interface: String,
        /// Interface addresses, repeatable
        #[arg(long = "address")]
        addresses: Vec<IpAddr>,
        #[arg(long, default_value_t = 1420)]
        mtu: u32,
        #[arg(long)]
        cert_dir: Option<PathBuf>,
    },
    /// Allocate a TURN relay and hold it until interrupted
    Relay {
        /// TURN server, host:port
        #[arg(long)]
        server: String,
        #[arg(long)]
        host_id: Option<String>,
        #[arg(long, env = "WGMESH_RELAY_SECRET")]
        secret: Option<String>,
        /// Peer to open a relay permission for; its datagrams are echoed to
        /// stdout while the allocation is held
        #[arg(long)]
        peer: Option<std::net::SocketAddr>,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Generate or refresh the self-signed certificate pair
    Cert {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Probe {
            servers,
            port,
            ipv6,
            timeout_secs,
        } => run_probe(servers, port, ipv6, Duration::from_secs(timeout_secs)).await,
        Command::Tunnel {
            local_port,
            remote,
            tls,
            udp_over_tcp,
            bind_to_wg,
            interface,
            addresses,
            mtu,
            cert_dir,
        } => {
            run_tunnel(
                local_port,
                remote,
                tls,
                udp_over_tcp,
                bind_to_wg,
                interface,
                addresses,
                mtu,
                cert_dir,
            )
            .await
        }
        Command::Relay {
            server,
            host_id,
            secret,
            peer,
            timeout_secs,
        } => run_relay(server, host_id, secret, peer, Duration::from_secs(timeout_secs)).await,
        Command::Cert { host, dir } => run_cert(host, dir),
    }
}

async fn run_probe(servers: Option<String>, port: u16, ipv6: bool, timeout: Duration) -> Result<()> {
    let servers: Vec<StunServer> = match servers {
        Some(list) => stun::parse_server_list(&list),
        None => stun::default_stun_servers(),
    };
    let family = if ipv6 { IpFamily::V6 } else { IpFamily::V4 };
    let endpoint =
        tokio::task::spawn_blocking(move || stun::hole_punch(&servers, port, family, timeout))
            .await?;
    match endpoint {
        Some(endpoint) => {
            println!(
                "public endpoint {}:{} ({})",
                endpoint.public_ip, endpoint.public_port, endpoint.nat
            );
            Ok(())
        }
        None => {
            warn!("every stun server failed, reachability unknown");
            Err(anyhow!("public endpoint could not be determined"))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_tunnel(
    local_port: u16,
    remote: String,
    tls: bool,
    udp_over_tcp: bool,
    bind_to_wg: bool,
    interface: String,
    addresses: Vec<IpAddr>,
    mtu: u32,
    cert_dir: Option<PathBuf>,
) -> Result<()> {
    let iface = Arc::new(StaticWgIface::new(&interface, mtu, addresses));
    let mgr = TunnelManager::new(iface);

    let mut config = WgTunnelConfig::new(local_port, remote);
    config.use_tls = tls;
    config.udp_over_tcp = udp_over_tcp;
    config.bind_to_wg = bind_to_wg;
    if tls {
        let certs = CertManager::new(cert_dir);
        config.tls = Some(TlsSettings {
            server: certs.server_tls_config("localhost")?,
            client: certs.client_tls_config(true)?,
        });
    }

    let addr = mgr.start_tunnel("cli", config).await?;
    println!("{}", serde_json::to_string_pretty(&mgr.active_tunnels().await)?);
    info!(local = %addr, "tunnel running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    mgr.stop_all().await;
    Ok(())
}

async fn run_relay(
    server: String,
    host_id: Option<String>,
    secret: Option<String>,
    peer: Option<std::net::SocketAddr>,
    timeout: Duration,
) -> Result<()> {
    let creds = match (host_id, secret) {
        (Some(host_id), Some(secret)) => Some(turn::RelayCredentials::for_host(&host_id, &secret)?),
        (None, None) => None,
        _ => return Err(anyhow!("--host-id and --secret must be given together")),
    };
    let client = Arc::new(turn::RelayClient::allocate(&server, creds.as_ref(), timeout).await?);
    println!("relay address {}", client.relay_addr());
    if let Some(mapped) = client.mapped_addr() {
        println!("mapped address {mapped}");
    }
    let keepalive = client.spawn_keepalive();

    if let Some(peer) = peer {
        client.create_permission(peer).await?;
        client.send_data(peer, b"wgmesh relay probe").await?;
        info!(peer = %peer, "relay permission open, echoing peer datagrams");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                incoming = client.recv_data(None) => match incoming {
                    Ok(Some((from, data))) => {
                        println!("{} bytes from {}: {}", data.len(), from, String::from_utf8_lossy(&data));
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "relay receive failed");
                        break;
                    }
                },
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    client.close().await;
    let _ = keepalive.await;
    Ok(())
}

fn run_cert(host: String, dir: Option<PathBuf>) -> Result<()> {
    let certs = CertManager::new(dir);
    let (cert_path, key_path) = certs.ensure_server_cert(&host)?;
    println!("certificate {}", cert_path.display());
    println!("key         {}", key_path.display());
    Ok(())
}
