//! prefab — converge a host to the state declared in one or more manifests.
//!
//! Usage:
//!   prefab converge web.json db.json   → merge manifests in order and converge
//!   prefab show web.json db.json       → print the merged manifest
//!   prefab config                      → print the effective engine config

use anyhow::Context;
use clap::{Parser, Subcommand};
use prefab_core::Manifest;
use prefab_engine::{Engine, EngineConfig, HttpFetcher, SystemHost};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "prefab",
    version = env!("CARGO_PKG_VERSION"),
    about = "Declarative host provisioning — converge a machine to its manifest"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine config file (TOML)
    #[arg(long, global = true, default_value = "/etc/prefab/prefab.toml")]
    config: PathBuf,

    /// Write logs to a file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the merged manifests to this host
    Converge {
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
    /// Print the merged manifests as JSON
    Show {
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
    /// Print the effective engine config as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Converge { manifests } => {
            let config = EngineConfig::load(&cli.config)?;
            let manifest = load_all(&manifests)?;
            converge(&config, &manifest).await?;
        }
        Commands::Show { manifests } => {
            println!("{}", load_all(&manifests)?.to_json());
        }
        Commands::Config => {
            print!("{}", EngineConfig::load(&cli.config)?.to_toml());
        }
    }

    Ok(())
}

fn load_all(paths: &[PathBuf]) -> anyhow::Result<Manifest> {
    paths
        .iter()
        .map(|p| Manifest::load(p).with_context(|| format!("loading {}", p.display())))
        .collect()
}

async fn converge(config: &EngineConfig, manifest: &Manifest) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let engine = Engine::new(
        config,
        Arc::new(SystemHost::new(config)),
        Arc::new(HttpFetcher::new()),
    )
    .with_cancellation(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    let report = engine.converge(manifest).await.context("convergence failed")?;
    println!(
        "converged: {} applied, {} already satisfied, {} archives fetched ({} failed)",
        report.applied, report.satisfied, report.fetch.fetched, report.fetch.failed
    );
    Ok(())
}

fn init_tracing(
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "prefab=info,prefab_engine=info,prefab_core=info".into());
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .context("--log-file must name a file")?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}
