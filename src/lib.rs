pub mod cancel;
pub mod config;
pub mod fleet;
pub mod health;
pub mod inventory;
pub mod journal;
pub mod scheduler;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cancel::CancelHandle;
use config::{Config, Settings};
use health::Readiness;
use inventory::{Inventory, InventorySource};
use scheduler::{AttemptContext, Scheduler};
use transport::ssh::SshConnector;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "journal-mirror",
    version,
    about = "Mirror the systemd journal of fleet hosts into local files over SSH"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log filter, e.g. `info` or `journal_mirror=debug` (RUST_LOG wins)
    #[arg(long, env = "JOURNAL_MIRROR_LOG", global = true)]
    pub log_level: Option<String>,

    /// Also write daily-rotated log files into this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mirror journals until interrupted
    Run(ConfigArgs),
    /// Validate configuration and keys, then print the effective configuration
    CheckConfig(ConfigArgs),
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// TOML configuration file
    #[arg(long, env = "JOURNAL_MIRROR_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub settings: Settings,
}

pub async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "journal-mirror", &mut std::io::stdout());
            Ok(())
        }
        Commands::CheckConfig(args) => {
            let _guard = init_tracing(cli.verbose, cli.log_level.as_deref(), None)?;
            check_config(args).await
        }
        Commands::Run(args) => {
            let _guard =
                init_tracing(cli.verbose, cli.log_level.as_deref(), cli.log_dir.as_deref())?;
            run_mirror(args).await
        }
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// writer and must live as long as the process logs.
pub fn init_tracing(
    verbose: u8,
    log_level: Option<&str>,
    log_dir: Option<&std::path::Path>,
) -> Result<Option<WorkerGuard>> {
    let fallback = match (log_level, verbose) {
        (Some(level), _) => level,
        (None, 0) => "info",
        (None, 1) => "debug",
        (None, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .with_context(|| format!("invalid log filter {fallback:?}"))?;

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "journal-mirror.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(guard)
}

fn load_config(args: ConfigArgs) -> Result<Config> {
    let settings = Settings::layered(args.config.as_deref(), args.settings)
        .context("failed to read configuration")?;
    Config::resolve(settings).context("invalid configuration")
}

async fn check_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(args)?;
    config.route().context("invalid ssh key material")?;

    let mut report = config.to_json();
    if let Some(path) = &config.inventory {
        let inventory = Inventory::load(path).await.context("invalid inventory")?;
        report["inventory_hosts"] = serde_json::json!(inventory.len());
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_mirror(args: ConfigArgs) -> Result<()> {
    let config = load_config(args)?;
    let route = config.route().context("invalid ssh key material")?;
    let inventory_path = config
        .inventory
        .clone()
        .ok_or_else(|| anyhow!("an inventory file is required to run (--inventory)"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        built = option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown"),
        target = option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown"),
        journal_dir = %config.local_journal_directory.display(),
        max_concurrent = config.max_concurrent,
        relay = config.bastion.as_ref().map(|b| b.host.as_str()).unwrap_or("none"),
        "journal-mirror starting"
    );

    let scheduler = Scheduler::new(
        config.scheduler_config(),
        AttemptContext {
            connector: Arc::new(SshConnector::new(config.ssh_options())),
            route,
            layout: config.layout(),
            journal: config.remote_journal(),
            stream: config.stream_options(),
        },
    );
    let shutdown = CancelHandle::new();
    let readiness = Readiness::default();

    let health_task = match &config.health_probe_bind_address {
        Some(addr) => {
            let listener = health::bind(addr).await?;
            Some(tokio::spawn(health::serve(
                listener,
                scheduler.clone(),
                readiness.clone(),
                shutdown.signal(),
            )))
        }
        None => None,
    };

    let mut source = InventorySource::new(
        &inventory_path,
        config.label_selector.clone(),
        config.ssh_port,
    );
    let summary = source
        .reload(&scheduler)
        .await
        .context("failed to load inventory")?;
    info!(
        submitted = summary.submitted,
        awaiting_address = summary.awaiting_address,
        "inventory loaded"
    );
    readiness.mark_ready();

    let mut watcher = tokio::spawn(inventory::watch(
        source,
        scheduler.clone(),
        inventory::DEFAULT_DEBOUNCE,
        shutdown.signal(),
    ));

    let mut outcome = Ok(());
    tokio::select! {
        signal = shutdown_signal() => match signal {
            Ok(name) => info!(signal = name, "shutting down"),
            Err(e) => {
                error!(error = %e, "failed to listen for shutdown signals");
                outcome = Err(e);
            }
        },
        finished = &mut watcher => {
            outcome = match finished {
                Ok(Ok(())) => Err(anyhow!("inventory watcher stopped unexpectedly")),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("inventory watcher failed")),
                Err(e) => Err(anyhow::Error::new(e).context("inventory watcher panicked")),
            };
        }
    }

    shutdown.cancel();
    scheduler.shutdown().await;
    if !watcher.is_finished() {
        if let Err(e) = watcher.await {
            warn!(error = %e, "inventory watcher did not stop cleanly");
        }
    }
    if let Some(task) = health_task
        && let Err(e) = task.await
    {
        warn!(error = %e, "health probe did not stop cleanly");
    }
    info!("journal-mirror stopped");
    outcome
}

async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for ctrl-c")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        Ok("ctrl-c")
    }
}
