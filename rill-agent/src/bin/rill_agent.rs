//! rill-agent: supervised remote log tailing, parsing and idempotent delivery.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rill_agent::bus::BusSettings;
use rill_agent::config::{
    expand_path, Config, DEFAULT_HIGH_WATER_MARK, DEFAULT_MAX_SPILL_BYTES, DEFAULT_SPILL_DIR,
};
use rill_agent::runner::{self, tap::TapOptions};
use rill_agent::supervisor::SupervisionPlan;
use rill_agent::{metrics, reconcile};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Parser)]
#[command(name = "rill-agent", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep the tail session, rotation watchdog and parser of one log alive.
    Supervise(ConfigArgs),
    /// Periodically replay the whole log to backfill what the live tail missed.
    Reconcile(ConfigArgs),
    /// Run a command (over ssh unless --local) and publish its stdout.
    Tap(TapArgs),
    /// Reassemble and parse a tap stream, publishing envelopes.
    Parse(ParseArgs),
    /// Batch envelopes into the document store.
    Deliver(DeliverArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, env = "RILL_AGENT_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Args)]
struct BusArgs {
    #[arg(long, default_value_t = DEFAULT_HIGH_WATER_MARK)]
    high_water_mark: usize,
    #[arg(long, default_value = DEFAULT_SPILL_DIR)]
    spill_dir: String,
    #[arg(long, default_value_t = DEFAULT_MAX_SPILL_BYTES)]
    max_spill_bytes: u64,
}

impl BusArgs {
    fn settings(&self) -> BusSettings {
        BusSettings {
            high_water_mark: self.high_water_mark.max(1),
            spill_dir: expand_path(&self.spill_dir),
            max_spill_bytes: self.max_spill_bytes,
        }
    }
}

#[derive(Args)]
struct TapArgs {
    #[arg(long)]
    host: String,
    #[arg(long)]
    command: String,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "", env = "RILL_AGENT_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    bind: String,
    #[arg(long)]
    local: bool,
    #[arg(long, default_value_t = 5_000)]
    linger_ms: u64,
    #[command(flatten)]
    bus: BusArgs,
}

#[derive(Args)]
struct ParseArgs {
    #[arg(long)]
    format: String,
    #[arg(long)]
    input: String,
    #[arg(long)]
    output: String,
    #[command(flatten)]
    bus: BusArgs,
}

#[derive(Args)]
struct DeliverArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Envelope publisher; defaults to `bus.parser_addr`.
    #[arg(long)]
    input: Option<String>,
    /// Delete documents outside the acceptance window and exit.
    #[arg(long)]
    prune: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cancel_token = CancellationToken::new();
    runner::install_signal_handlers(cancel_token.clone())?;

    match cli.command {
        Command::Supervise(args) => {
            let (config, config_path) = load_config(&args.config)?;
            spawn_metrics_server(&config, &cancel_token)?;
            let plan = SupervisionPlan::live(&config, &config_path)?;
            runner::supervise::run(&config, plan, cancel_token).await
        }
        Command::Reconcile(args) => {
            let (config, config_path) = load_config(&args.config)?;
            spawn_metrics_server(&config, &cancel_token)?;
            let plan = reconcile::plan(&config, &config_path)?;
            runner::supervise::run(&config, plan, cancel_token).await
        }
        Command::Tap(args) => {
            let settings = args.bus.settings();
            let options = TapOptions {
                host: args.host,
                command: args.command,
                username: args.username,
                password: args.password,
                bind: args.bind,
                local: args.local,
                linger: Duration::from_millis(args.linger_ms),
            };
            let code = runner::tap::run(options, settings, cancel_token).await?;
            std::process::exit(code);
        }
        Command::Parse(args) => {
            runner::parse::run(
                &args.format,
                &args.input,
                &args.output,
                args.bus.settings(),
                cancel_token,
            )
            .await
        }
        Command::Deliver(args) => {
            let (config, _) = load_config(&args.config.config)?;
            if args.prune {
                runner::deliver::prune(&config, cancel_token).await?;
                return Ok(());
            }
            spawn_metrics_server(&config, &cancel_token)?;
            runner::deliver::run(&config, args.input.as_deref(), cancel_token).await
        }
    }
}

/// Load and validate the configuration; the returned path is absolute so it can be
/// handed to children started from another directory.
fn load_config(path: &Path) -> Result<(Config, PathBuf)> {
    let config = Config::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    let absolute = path
        .canonicalize()
        .with_context(|| format!("failed to resolve config path {}", path.display()))?;
    Ok((config, absolute))
}

fn spawn_metrics_server(config: &Config, cancel_token: &CancellationToken) -> Result<()> {
    let Some(addr) = config.metrics.addr.as_deref() else {
        return Ok(());
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics.addr {addr}"))?;
    let cancel_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(addr, cancel_token).await {
            error!(error = %err, "metrics server exited");
        }
    });
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
