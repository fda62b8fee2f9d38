// modlink node: host accepts participants, participant joins a host; both check modules first.

mod config;
mod diagnostic;
mod manifest;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use modlink_core::{Negotiator, Role};
use tokio::net::TcpListener;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: modlink-node [host | join <addr>] [--version]";

fn main() -> anyhow::Result<()> {
    let mut role = None;
    let mut connect = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("modlink-node {}", VERSION);
                return Ok(());
            }
            "host" => role = Some(Role::Host),
            "join" => {
                role = Some(Role::Participant);
                let addr = args.next().context(USAGE)?;
                connect = Some(addr.parse().with_context(|| format!("bad address {addr:?}"))?);
            }
            other => anyhow::bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }

    let mut cfg = config::load()?;
    if let Some(r) = role {
        cfg.role = r;
    }
    if connect.is_some() {
        cfg.connect_addr = connect;
    }
    init_tracing(&cfg.log_level);

    let manifest = match &cfg.manifest_path {
        Some(path) => manifest::Manifest::load(path)?,
        None => manifest::Manifest::default(),
    };
    tracing::info!(role = %cfg.role, modules = manifest.len(), "starting");

    let mut negotiator = Negotiator::new(cfg.role, cfg.host_info()?, manifest);
    negotiator.set_retention(cfg.retention);
    let negotiator = Arc::new(tokio::sync::Mutex::new(negotiator));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cfg.role {
            Role::Host => run_host(&cfg, negotiator).await,
            Role::Participant => run_participant(&cfg, negotiator).await,
        }
    })
}

async fn run_host(
    cfg: &config::Config,
    negotiator: transport::SharedNegotiator,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding port {}", cfg.listen_port))?;
    tracing::info!(port = cfg.listen_port, "hosting");
    tokio::select! {
        r = transport::serve(listener, negotiator, cfg.handshake_timeout()) => r?,
        r = shutdown_signal() => r?,
    }
    Ok(())
}

async fn run_participant(
    cfg: &config::Config,
    negotiator: transport::SharedNegotiator,
) -> anyhow::Result<()> {
    let addr = cfg
        .connect_addr
        .context("participant needs connect_addr (or `join <addr>`)")?;
    match transport::join(&negotiator, addr, &cfg.name, cfg.handshake_timeout()).await? {
        transport::Joined::Rejected(reason) => {
            anyhow::bail!("host {addr} refused to admit us: {reason:?}")
        }
        transport::Joined::Accepted(stream) => {
            tokio::select! {
                r = transport::stay_connected(&negotiator, stream) => r?,
                r = shutdown_signal() => r?,
            }
        }
    }
    Ok(())
}

/// RUST_LOG wins over the configured level.
fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}
