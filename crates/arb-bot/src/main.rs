//! arb-bot: YES/NO basket arbitrage engine.
//!
//! Usage:
//!   arb-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>   Config file path (default: config/bot.toml)
//!   -m, --mode <MODE>     Engine mode: live, backtest
//!   --start <RFC3339>     Backtest window start
//!   --end <RFC3339>       Backtest window end
//!
//! Exit codes: 0 normal, 1 configuration error, 2 unrecoverable venue
//! error, 3 safety trip with unclean flatten.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use arb_bot::auth::ApiCredentials;
use arb_bot::command::{command_channel, run_stdin_control};
use arb_bot::config::{BotConfig, BotMode};
use arb_bot::engine::{EngineChannels, EngineExit, TradingEngine};
use arb_bot::execution::{build_signer, spawn_dispatch_pool, DryRunExecution, LiveExecution};
use arb_bot::logging::setup_logging;
use arb_bot::persistence::{load_events_for_replay, spawn_writer};
use arb_bot::rest::{spawn_resync_worker, RestClient};
use arb_bot::ws_market::{spawn_market_stream, MarketStreamConfig};
use arb_bot::ws_user::{spawn_user_stream, UserStreamConfig};
use arb_bot::BacktestHarness;

#[derive(Parser, Debug)]
#[command(name = "arb-bot")]
#[command(about = "Deterministic YES/NO basket arbitrage engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Engine mode: live, backtest (overrides config/env)
    #[arg(short, long)]
    mode: Option<String>,

    /// Backtest window start (RFC3339)
    #[arg(long)]
    start: Option<String>,

    /// Backtest window end (RFC3339)
    #[arg(long)]
    end: Option<String>,
}

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_VENUE_ERROR: u8 = 2;
const EXIT_SAFETY_UNCLEAN: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = dotenvy::dotenv() {
        if !matches!(err, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("warning: failed to load .env: {err}");
        }
    }
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    setup_logging(&config.runtime.log_level);

    let mode = match config.mode() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match mode {
        BotMode::Backtest => run_backtest(&args, config),
        BotMode::Live => run_live(&args, config).await,
    }
}

fn load_config(args: &Args) -> Result<BotConfig> {
    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)?
    } else {
        warn!(config = %args.config.display(), "config file not found; using defaults");
        BotConfig::default()
    };
    config.apply_env_overrides();
    if let Some(mode) = &args.mode {
        config.runtime.mode = mode.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_bound(raw: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw {
        None => Ok(None),
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid RFC3339 timestamp: {raw}"))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
    }
}

fn run_backtest(args: &Args, config: BotConfig) -> ExitCode {
    let bounds = match (parse_bound(&args.start), parse_bound(&args.end)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let events =
        match load_events_for_replay(&config.persistence.db_path, bounds.0, bounds.1) {
            Ok(events) => events,
            Err(err) => {
                eprintln!("failed to load event log: {err}");
                return ExitCode::from(EXIT_CONFIG_ERROR);
            }
        };
    info!(events = events.len(), "replaying event log");
    let mut harness = match BacktestHarness::new(&config) {
        Ok(harness) => harness,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let report = harness.run(&events);
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to serialise report: {err}"),
    }
    ExitCode::SUCCESS
}

async fn run_live(args: &Args, mut config: BotConfig) -> ExitCode {
    // Signing is delegated; if no signer can be built the engine runs dry.
    let signer = match build_signer(
        &config.venue.private_key,
        &config.venue.signature_scheme,
    ) {
        Ok(signer) => Some(signer),
        Err(err) => {
            warn!(error = %err, "signer unavailable; forcing DRY_RUN");
            config.runtime.dry_run = true;
            None
        }
    };

    let (persistence, writer_join) = match spawn_writer(&config.persistence) {
        Ok(ok) => ok,
        Err(err) => {
            eprintln!("failed to open store: {err}");
            return ExitCode::from(EXIT_VENUE_ERROR);
        }
    };

    let (event_tx, events_rx) = mpsc::channel(config.runtime.event_queue_capacity);
    let (command_tx, commands_rx) = command_channel(config.runtime.command_queue_capacity);
    let (jobs_tx, jobs_rx) = mpsc::channel(1024);
    let (resync_tx, resync_rx) = mpsc::channel(1024);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let adapter: Arc<dyn arb_bot::ExecutionAdapter> = match (config.runtime.dry_run, signer) {
        (false, Some(signer)) => Arc::new(LiveExecution::new(
            config.venue.rest_url.clone(),
            ApiCredentials {
                api_key: config.venue.api_key.clone(),
                api_secret: config.venue.api_secret.clone(),
                api_passphrase: config.venue.api_passphrase.clone(),
            },
            signer,
            config.venue.chain_id,
        )),
        _ => {
            info!("dry run: venue calls are synthetic");
            Arc::new(DryRunExecution)
        }
    };

    let engine = match TradingEngine::new(
        config.clone(),
        Some(args.config.clone()),
        persistence.clone(),
        EngineChannels {
            events_rx,
            commands_rx,
            jobs_tx,
            resync_tx: resync_tx.clone(),
        },
    ) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let tokens: Vec<(String, String)> = config
        .markets
        .iter()
        .flat_map(|m| {
            m.outcomes
                .iter()
                .map(|o| (m.market_id.clone(), o.token_id.clone()))
        })
        .collect();

    let pool_join = spawn_dispatch_pool(
        adapter,
        config.order.max_in_flight,
        jobs_rx,
        event_tx.clone(),
    );
    let resync_join = spawn_resync_worker(
        RestClient::new(config.venue.rest_url.clone()),
        resync_rx,
        event_tx.clone(),
    );
    let market_join = spawn_market_stream(
        MarketStreamConfig {
            ws_url: config.venue.ws_url.clone(),
            tokens,
        },
        event_tx.clone(),
        resync_tx,
        shutdown_rx.clone(),
    );
    let user_join = spawn_user_stream(
        UserStreamConfig {
            ws_url: config.venue.ws_url.clone(),
            creds: ApiCredentials {
                api_key: config.venue.api_key.clone(),
                api_secret: config.venue.api_secret.clone(),
                api_passphrase: config.venue.api_passphrase.clone(),
            },
            chain_id: config.venue.chain_id,
        },
        event_tx,
        shutdown_rx,
    );
    let control_join = tokio::spawn(run_stdin_control(command_tx));

    let exit = engine.run().await;

    // Supervisor teardown: flip shutdown and reap the worker tasks. The
    // store writer exits on its shutdown message (idempotent if the engine
    // already flushed it).
    let _ = shutdown_tx.send(true);
    market_join.abort();
    user_join.abort();
    resync_join.abort();
    pool_join.abort();
    control_join.abort();
    persistence.shutdown().await;
    drop(persistence);
    let _ = writer_join.join();

    match exit {
        EngineExit::Clean => ExitCode::SUCCESS,
        EngineExit::SafetyUnclean => ExitCode::from(EXIT_SAFETY_UNCLEAN),
    }
}
