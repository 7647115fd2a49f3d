// Ferry node: share files from one directory, fetch files from peers into another.

mod codec;
mod config;
mod peer;
mod registry;
mod store;
mod transport;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::peer::{Peer, PeerConfig};
use crate::transport::TcpTransport;

#[derive(Debug, Parser)]
#[command(name = "ferry-node", version, about = "Exchange files directly between peers over TCP")]
struct Cli {
    /// Peer ID (e.g. peer1)
    #[arg(long)]
    id: String,
    /// Port to listen on
    #[arg(long)]
    port: u16,
    /// File in the shared directory to make available
    #[arg(long, conflicts_with = "receive")]
    send: Option<String>,
    /// Name of a file to fetch from --peer
    #[arg(long, requires = "peer")]
    receive: Option<String>,
    /// Address of the peer to fetch from (e.g. localhost:3000)
    #[arg(long)]
    peer: Option<String>,
    /// Directory for shared files (default: ./shared{suffix of id})
    #[arg(long)]
    shared: Option<PathBuf>,
    /// Directory for received files (default: ./received{suffix of id})
    #[arg(long)]
    received: Option<PathBuf>,
    /// Config file (default: ~/.config/ferry/config.toml, then /etc/ferry/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// "peer1" -> "1"; ids without the prefix are used whole.
fn dir_suffix(id: &str) -> &str {
    id.strip_prefix("peer").unwrap_or(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.id.is_empty() {
        bail!("--id must not be empty");
    }
    let cfg = config::load(cli.config.as_deref()).context("failed to load config")?;

    let suffix = dir_suffix(&cli.id);
    let shared_dir = cli
        .shared
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("./shared{suffix}")));
    let received_dir = cli
        .received
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("./received{suffix}")));
    let listen_addr = format!("{}:{}", cfg.listen_host, cli.port);

    let transport = TcpTransport::new(cfg.transport());
    let peer = Peer::new(
        PeerConfig {
            id: cli.id.clone(),
            listen_addr: listen_addr.clone(),
            shared_dir: shared_dir.clone(),
            received_dir: received_dir.clone(),
            retry: cfg.retry_policy(),
            request_ttl: cfg.request_ttl(),
        },
        transport,
    )
    .await
    .context("failed to set up peer directories")?;
    peer.start()
        .await
        .with_context(|| format!("failed to listen on {listen_addr}"))?;

    if let Some(name) = cli.receive.as_deref() {
        // clap guarantees --peer is present with --receive.
        let target = cli.peer.as_deref().unwrap_or_default();
        if let Err(e) = peer.request_file(target, name).await {
            tracing::error!(error = %e, file = name, "file receive error");
        }
    } else if let Some(name) = cli.send.as_deref() {
        match peer.send_file(name).await {
            Ok(()) => tracing::info!(file = name, "ready to send file"),
            Err(e) => tracing::error!(error = %e, file = name, "file send error"),
        }
    } else {
        if let Some(addr) = peer.local_addr() {
            tracing::info!(id = %cli.id, %addr, "peer listening");
        }
        tracing::info!(dir = %shared_dir.display(), "shared directory");
        tracing::info!(dir = %received_dir.display(), "received files directory");
    }

    shutdown_signal().await?;
    peer.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_suffix_strips_peer_prefix() {
        assert_eq!(dir_suffix("peer1"), "1");
        assert_eq!(dir_suffix("alice"), "alice");
        assert_eq!(dir_suffix("peer"), "");
    }

    #[test]
    fn receive_requires_peer() {
        let base = ["ferry-node", "--id", "peer2", "--port", "3001", "--receive", "a.txt"];
        assert!(Cli::try_parse_from(base).is_err());
        let cli = Cli::try_parse_from(base.into_iter().chain(["--peer", "localhost:3000"])).unwrap();
        assert_eq!(cli.peer.as_deref(), Some("localhost:3000"));
    }

    #[test]
    fn id_and_port_required() {
        assert!(Cli::try_parse_from(["ferry-node", "--port", "3000"]).is_err());
        assert!(Cli::try_parse_from(["ferry-node", "--id", "peer1"]).is_err());
    }

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
