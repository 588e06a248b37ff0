use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prizeline_client::{EvmBalance, EvmTransfer, HttpStandings};
use prizeline_node::{
    commands,
    server::{metrics_auth_token, spawn_metrics_server},
    Config, LogFormat, ValidatedConfig,
};
use prizeline_settlement::{
    cancellation, MemorySchedule, SettlementEngine, SettlementMetrics, SqliteStore,
};
use prizeline_types::{Rank, TournamentId};
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

type Engine = SettlementEngine<SqliteStore, SqliteStore, HttpStandings, EvmBalance, EvmTransfer>;

#[derive(Parser)]
#[command(name = "prizeline", about = "Settle tournament rewards on an EVM chain.")]
struct Cli {
    #[arg(long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a reward schedule file into the ledger database.
    Configure {
        /// Defaults to `schedule_path` from the config.
        #[arg(long)]
        schedule: Option<PathBuf>,
    },
    /// Pay every unpaid rank of a tournament.
    Settle {
        #[arg(long)]
        tournament: TournamentId,
        /// Wait for every confirmation before exiting.
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        serve_metrics: bool,
    },
    /// Make a new attempt at a rank whose latest payout failed.
    Retry {
        #[arg(long)]
        tournament: TournamentId,
        #[arg(long)]
        rank: Rank,
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        serve_metrics: bool,
    },
    /// Resolve payouts left PENDING by an earlier run.
    Recover {
        #[arg(long)]
        serve_metrics: bool,
    },
    /// Print the ledger of a tournament as JSON.
    Report {
        #[arg(long)]
        tournament: TournamentId,
    },
    /// Validate the config file and print it with secrets redacted.
    CheckConfig,
}

fn main() {
    if let Err(err) = main_result() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn main_result() -> Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_file = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Could not read config file {}", cli.config.display()))?;
    let config: Config =
        serde_yaml::from_str(&config_file).context("Could not parse config file")?;
    let redacted = format!("{:?}", config.redacted_debug());

    if let Command::CheckConfig = cli.command {
        println!("{:#?}", config.redacted_debug());
        let config = config.validate().context("Invalid config")?;
        if config.payer_private_key.is_none() {
            println!("warning: no payer private key; settle, retry and recover will refuse to run");
        }
        println!("config ok");
        return Ok(());
    }

    let config = config.validate().context("Invalid config")?;
    init_logging(config.log_level, config.log_format);
    info!(config = %redacted, "loaded config file");

    let runtime = tokio::runtime::Runtime::new().context("Could not start runtime")?;
    runtime.block_on(run(cli.command, config))
}

fn init_logging(level: Level, format: LogFormat) {
    // Stdout carries command output.
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(command: Command, config: ValidatedConfig) -> Result<()> {
    let store = Arc::new(
        SqliteStore::open(&config.ledger_path)
            .with_context(|| format!("Could not open ledger {}", config.ledger_path.display()))?,
    );

    match command {
        Command::Configure { schedule } => {
            let path = schedule
                .or_else(|| config.schedule_path.clone())
                .context("No schedule file: pass --schedule or set schedule_path")?;
            let schedule = MemorySchedule::load(&path, config.decimals)
                .with_context(|| format!("Could not load schedule {}", path.display()))?;
            let configured = commands::configure(&store, &schedule)?;
            print_json(&serde_json::json!({ "configured": configured }))
        }
        Command::Settle {
            tournament,
            wait,
            serve_metrics,
        } => {
            let (metrics, server) = start_metrics(&config, serve_metrics).await?;
            let engine = build_engine(&config, store, metrics)?;
            let (cancel, signal) = cancellation();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted: no further payouts will be submitted");
                    cancel.cancel();
                }
            });
            let report = commands::settle(&engine, tournament, wait, signal).await;
            stop_metrics(server);
            print_json(&report.context("Settlement failed")?)
        }
        Command::Retry {
            tournament,
            rank,
            wait,
            serve_metrics,
        } => {
            let (metrics, server) = start_metrics(&config, serve_metrics).await?;
            let engine = build_engine(&config, store, metrics)?;
            let report = commands::retry(&engine, tournament, rank, wait).await;
            stop_metrics(server);
            print_json(&report.context("Retry failed")?)
        }
        Command::Recover { serve_metrics } => {
            let (metrics, server) = start_metrics(&config, serve_metrics).await?;
            let engine = build_engine(&config, store, metrics)?;
            let report = commands::recover(&engine).await;
            stop_metrics(server);
            print_json(&report.context("Recovery failed")?)
        }
        Command::Report { tournament } => {
            print_json(&commands::ledger_report(store.as_ref(), tournament)?)
        }
        Command::CheckConfig => Ok(()),
    }
}

fn build_engine(
    config: &ValidatedConfig,
    store: Arc<SqliteStore>,
    metrics: SettlementMetrics,
) -> Result<Engine> {
    let transfer_config = config
        .transfer_config()
        .context("Payouts need a signing key")?;
    let transfer =
        EvmTransfer::connect(transfer_config).context("Failed to create transfer client")?;
    let balances = EvmBalance::new(transfer.provider().clone());
    let standings =
        HttpStandings::new(&config.standings_url).context("Failed to create standings client")?;
    let engine_config = config.engine_config(transfer.payer());
    Ok(SettlementEngine::new(
        store.clone(),
        store,
        standings,
        balances,
        transfer,
        engine_config,
    )
    .with_metrics(metrics))
}

async fn start_metrics(
    config: &ValidatedConfig,
    serve: bool,
) -> Result<(SettlementMetrics, Option<JoinHandle<()>>)> {
    if !serve {
        return Ok((SettlementMetrics::default(), None));
    }
    let port = config
        .metrics_port
        .context("--serve-metrics needs metrics_port in the config")?;
    let mut registry = Registry::default();
    let metrics = SettlementMetrics::register(&mut registry);
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let (_, handle) = spawn_metrics_server(addr, registry, metrics_auth_token())
        .await
        .with_context(|| format!("Could not bind metrics server on {addr}"))?;
    Ok((metrics, Some(handle)))
}

fn stop_metrics(server: Option<JoinHandle<()>>) {
    if let Some(server) = server {
        server.abort();
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let output = serde_json::to_string_pretty(value).context("Could not encode output")?;
    println!("{output}");
    Ok(())
}
