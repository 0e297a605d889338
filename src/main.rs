use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use flowsched::agent::Agent;
use flowsched::config::Config;
use flowsched::fabric::TopologyView;
use flowsched::version;

/// Congestion-aware multipath flow scheduler for SDN fabrics.
#[derive(Parser)]
#[command(name = "flowsched", about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, a level or an EnvFilter directive (e.g. "flowsched=debug").
    /// Overrides `log_level` from the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print build information.
    Version,
    /// Load and validate the configuration and topology without contacting
    /// the controller.
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        println!("flowsched {}", version::full());
        return Ok(());
    }

    let path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = load_config(&path)?;

    init_tracing(cfg.log_filter(cli.log_level.as_deref()))?;

    if let Some(Command::Check) = cli.command {
        return check(&cfg);
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        controller = %cfg.controller.base_url(),
        "starting flowsched",
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(serve(cfg))
}

fn init_tracing(directive: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directive)
        .with_context(|| format!("invalid log level: {directive}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

fn check(cfg: &Config) -> Result<()> {
    let topology = TopologyView::load(&cfg.topology).context("loading topology")?;

    println!(
        "configuration ok: {} switches, controller {}, {} groups every {:?}",
        topology.switches().count(),
        cfg.controller.base_url(),
        cfg.scheduler.num_groups,
        cfg.scheduler.interval,
    );

    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let signal = wait_for_shutdown().await;

    agent.stop().await?;
    tracing::info!("flowsched stopped");

    signal
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("waiting for SIGINT")?;
            tracing::info!(signal = "SIGINT", "shutting down");
        }
        _ = terminate.recv() => {
            tracing::info!(signal = "SIGTERM", "shutting down");
        }
    }

    Ok(())
}
