//! XMPP file-transfer bytestream tool

mod args;

use std::net::IpAddr;
use std::path::Path;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use xmpp_ft::config::FtConfig;
use xmpp_ft::constants::*;
use xmpp_ft::pool::{DataChannel, PoolEvent, SocketPool, TokioSocketPool, socks5_connect};
use xmpp_ft::relay::{CandidatePlan, build_candidates, is_private_ipv4, local_addresses};
use xmpp_ft::upnp::{UpnpOutcome, map_port};
use xmpp_ft_common::Jid;
use xmpp_ft_common::socks5::destination_hash;

use args::Args;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("{}{}", MSG_BANNER, env!("CARGO_PKG_VERSION"));

    setup_tracing(args.debug);

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}{}", ERR_GENERIC, e);
            std::process::exit(1);
        }
    };
    let jid = parse_jid(&args.jid);

    if let Some(address) = &args.dial {
        let peer = require_peer(&args);
        run_dial(&config, &args.sid, &peer, &jid, address).await;
    } else if let Some(path) = &args.listen {
        let peer = require_peer(&args);
        run_listener(&config, &args.sid, &jid, &peer, path).await;
    } else {
        print_candidates(&config, &jid).await;
    }
}

/// `RUST_LOG` wins; otherwise `--debug` picks the level
fn setup_tracing(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn load_config(args: &Args) -> xmpp_ft::error::Result<FtConfig> {
    let mut config = FtConfig::load_or_default(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.file_transfers_port = port;
    }
    if args.upnp {
        config.upnp = true;
    }
    if !args.additional_hosts.is_empty() {
        config.additional_hosts = args.additional_hosts.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_jid(value: &str) -> Jid {
    match Jid::parse(value) {
        Ok(jid) => jid,
        Err(e) => {
            eprintln!("{}{}: {}", ERR_INVALID_JID, value, e);
            std::process::exit(1);
        }
    }
}

fn require_peer(args: &Args) -> Jid {
    match &args.peer {
        Some(peer) => parse_jid(peer),
        None => {
            eprintln!("{}", ERR_PEER_REQUIRED);
            std::process::exit(1);
        }
    }
}

async fn print_candidates(config: &FtConfig, jid: &Jid) {
    let local_ips = if config.send_local_ips {
        local_addresses(None).unwrap_or_else(|e| {
            warn!("{}{}", WARN_NO_LOCAL_IPS, e);
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let mut upnp = None;
    if config.upnp
        && let Some(IpAddr::V4(local)) = local_ips.first().copied()
        && is_private_ipv4(local)
    {
        match map_port(local, config.file_transfers_port, config.upnp_timeout()).await {
            UpnpOutcome::Mapped(external) => {
                info!("{}{}", MSG_UPNP_MAPPED, external);
                upnp = Some(external);
            }
            UpnpOutcome::Failed(e) => warn!("{}{}", WARN_UPNP_FAILED, e),
            UpnpOutcome::TimedOut => warn!("{}", WARN_UPNP_TIMEOUT),
        }
    }

    let candidates = build_candidates(&CandidatePlan {
        sender: jid,
        port: config.file_transfers_port,
        additional_hosts: &config.additional_hosts,
        local_ips: &local_ips,
        upnp,
        proxies: &[],
    });

    println!("{}{}", MSG_CANDIDATES, jid);
    for entry in candidates {
        println!(
            "  {} {}:{}",
            entry.jid.unwrap_or_default(),
            entry.host.unwrap_or_default(),
            entry.port.unwrap_or_default()
        );
    }
}

/// Act as target: dial `address` with the hash for a transfer from `initiator`
async fn run_dial(config: &FtConfig, sid: &str, initiator: &Jid, target: &Jid, address: &str) {
    let Some((host, port)) = address
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
    else {
        eprintln!("{}{}", ERR_DIAL_ADDRESS, address);
        std::process::exit(1);
    };

    let auth_hash = destination_hash(sid, initiator, target);
    debug!(host, port, hash = %auth_hash, "probing streamhost");
    match tokio::time::timeout(config.connect_timeout(), socks5_connect(host, port, &auth_hash))
        .await
    {
        Ok(Ok(_stream)) => println!("{}{}", MSG_DIAL_OK, address),
        Ok(Err(e)) => {
            eprintln!("{}{}", ERR_DIAL_FAILED, e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{}{}", ERR_DIAL_FAILED, e);
            std::process::exit(1);
        }
    }
}

/// Act as initiator: accept the target on our listener and send `path`
async fn run_listener(config: &FtConfig, sid: &str, initiator: &Jid, target: &Jid, path: &Path) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut pool = TokioSocketPool::new(events_tx, config.connect_timeout());
    let auth_hash = destination_hash(sid, initiator, target);

    if !pool.start_listener(config.file_transfers_port, &auth_hash, sid) {
        std::process::exit(1);
    }
    println!("{}{}", MSG_WAITING_PEER, auth_hash);

    let shutdown = setup_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            Some(event) = events.recv() => match event {
                PoolEvent::PeerConnected { sid, auth_hash } => {
                    pool.send_file(&sid, DataChannel::Inbound(auth_hash), path, 0);
                }
                PoolEvent::Progress { bytes, .. } => debug!(bytes, "progress"),
                PoolEvent::Finished { .. } => {
                    println!("{}{}", MSG_SEND_DONE, path.display());
                    break;
                }
                PoolEvent::Failed { reason, .. } => {
                    eprintln!("{}{}", ERR_SEND_FAILED, reason);
                    std::process::exit(1);
                }
                other => debug!(event = ?other, "ignored pool event"),
            },
        }
    }

    pool.remove_sender(&auth_hash);
}

/// Setup shutdown signal handler
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = sigint.recv() => {},
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                eprintln!("{}{}", ERR_SIGNAL, e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("{}{}", ERR_SIGNAL, e);
            std::future::pending::<()>().await;
        }
    }
}
