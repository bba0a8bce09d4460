use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proftop::aggregate::report::WriterSink;
use proftop::config::Config;
use proftop::export::health::HealthMetrics;
use proftop::session::Session;
use proftop::tracer::ReplaySource;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Live keyed aggregation and event-pair correlation over trace samples.
#[derive(Parser)]
#[command(name = "proftop", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Framed sample file to replay. Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file when given.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("proftop {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Reports own stdout, so logs go to stderr.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        mode = ?cfg.mode,
        "starting proftop",
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, cli.input))
}

async fn run(cfg: Config, input: Option<PathBuf>) -> Result<()> {
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        signal_cancel.cancel();
    });

    let health = match &cfg.health.addr {
        Some(addr) => {
            let health = Arc::new(HealthMetrics::new(addr).context("creating health metrics")?);
            health.start().await.context("starting health metrics server")?;
            Some(health)
        }
        None => None,
    };

    let geometry = cfg.display.geometry(std::io::stdout().is_terminal());
    let mut session = Session::from_config(&cfg, Box::new(WriterSink::stdout()), geometry)?;
    if let Some(health) = &health {
        session = session.with_health(Arc::clone(health));
    }

    let source = ReplaySource::open(input.as_deref()).await?;
    let stats = session.run(source, cfg.interval, cancel).await;

    if let Some(health) = &health {
        health.stop().await?;
    }

    tracing::info!(
        received = stats.received,
        decoded = stats.decoded,
        cycles = stats.cycles,
        "proftop stopped"
    );

    Ok(())
}
