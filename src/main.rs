mod cli;

use anyhow::Context;
use clap::Parser;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rallyprobe::probe::run_responder;
use rallyprobe::{Config, PingTracker, ServerDescriptor, UdpProbeTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Probe {
            servers,
            wait,
            timeout_ms,
        } => probe(servers, wait, timeout_ms).await,
        cli::Command::Serve { port } => serve(port).await,
    }
}

async fn probe(path: std::path::PathBuf, wait: u64, timeout_ms: u64) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading server list {}", path.display()))?;
    let servers: Vec<ServerDescriptor> =
        serde_json::from_str(&raw).context("parsing server list")?;
    if servers.is_empty() {
        anyhow::bail!("server list is empty");
    }

    let transport = UdpProbeTransport::new(Duration::from_millis(timeout_ms));
    let tracker = PingTracker::new(transport, Config::default());
    let mut events = tracker.subscribe();

    tracker.set_servers(servers.clone());
    tracker.refresh_pings().await;

    let deadline = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);

    let mut remaining = servers.len();
    while remaining > 0 {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(e) => {
                    println!(
                        "{:>8.1} ms  {} (#{})",
                        e.ping.as_secs_f64() * 1000.0,
                        e.server.description,
                        e.server.id,
                    );
                    remaining -= 1;
                }
                Err(_) => break,
            },
        }
    }

    for server in &servers {
        if tracker.cached_ping(server.id).is_none() {
            println!("      --     {} (#{}) unreachable", server.description, server.id);
        }
    }
    Ok(())
}

async fn serve(port: u16) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding udp port {port}"))?;
    println!("answering pings on 0.0.0.0:{port}");
    run_responder(socket, CancellationToken::new()).await?;
    Ok(())
}
