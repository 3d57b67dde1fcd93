//! Trend-Signal — trend/RSI signal engine, backtester and live watcher
//!
//! Usage:
//!   trend-signal backtest --pair XXBTZUSD   — Backtest on daily Kraken data
//!   trend-signal signal                     — Print the current signals
//!   trend-signal watch                      — Poll and record confirmed actions
//!   trend-signal serve --port 3001          — Launch the HTTP API

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use engine::{
    run_live, save_result, BacktestConfig, BacktestEngine, BacktestResult, Interval,
    KrakenClient, LiveOrchestrator, LiveProgress, MarketData, OrchestratorConfig, RsiSmoothing,
    SignalMode, StrategyConfig, SystemClock,
};
use persistence::repository::BacktestRepository;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "trend-signal")]
#[command(about = "Trend/RSI signal engine with MACD confirmation and backtesting", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest the trend rule on historical Kraken data
    Backtest {
        /// Kraken pair name
        #[arg(long, default_value = "XXBTZUSD")]
        pair: String,
        /// Bar interval in minutes
        #[arg(long, default_value_t = 1440)]
        interval: u32,
        /// Starting capital
        #[arg(long, default_value_t = 10_000.0)]
        capital: f64,
        #[arg(long, default_value_t = 10)]
        rsi_period: usize,
        #[arg(long, default_value_t = 200)]
        sma_period: usize,
        #[arg(long, default_value_t = 30.0)]
        buy_threshold: f64,
        #[arg(long, default_value_t = 40.0)]
        sell_threshold: f64,
        /// RSI smoothing: continuous, windowed
        #[arg(long, default_value = "continuous")]
        smoothing: String,
        /// Only act when the MACD crossover agrees on the same bar
        #[arg(long)]
        confirm_macd: bool,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<String>,
        /// Skip storing the run in the database
        #[arg(long)]
        no_save: bool,
    },
    /// Print the current trend and MACD signals (nothing is recorded)
    Signal {
        #[arg(long, default_value = "XXBTZUSD")]
        pair: String,
    },
    /// Poll the market and record confirmed actions until Ctrl+C
    Watch {
        #[arg(long, default_value = "XXBTZUSD")]
        pair: String,
        /// Seconds between polls
        #[arg(long, default_value_t = 600)]
        poll_secs: u64,
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// List stored backtest runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Launch the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
}

#[derive(Clone)]
struct AppState {
    kraken: KrakenClient,
    db: Arc<persistence::Database>,
    live_progress: Arc<LiveProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,trend_signal=debug")
    } else {
        EnvFilter::new("info,engine=info,trend_signal=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn parse_smoothing(s: &str) -> RsiSmoothing {
    match s.to_lowercase().as_str() {
        "windowed" => RsiSmoothing::Windowed,
        _ => RsiSmoothing::Continuous,
    }
}

fn db_path() -> String {
    std::env::var("SIGNAL_DB_PATH").unwrap_or_else(|_| "data/backtests.db".to_string())
}

fn kraken_client() -> KrakenClient {
    match std::env::var("KRAKEN_API_URL") {
        Ok(url) => KrakenClient::with_base_url(url),
        Err(_) => KrakenClient::new(),
    }
}

fn orchestrator_config(pair: String) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        pair,
        ..Default::default()
    };
    if let Ok(path) = std::env::var("SIGNAL_ACTION_FILE") {
        config.action_file = PathBuf::from(path);
    }
    config
}

async fn open_db() -> anyhow::Result<(persistence::Database, String)> {
    let path = db_path();
    let db = persistence::Database::new(&path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    Ok((db, path))
}

fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Backtest {
            pair,
            interval,
            capital,
            rsi_period,
            sma_period,
            buy_threshold,
            sell_threshold,
            smoothing,
            confirm_macd,
            export,
            no_save,
        } => {
            let config = BacktestConfig {
                pair,
                interval: Interval::from_minutes(interval)?,
                initial_capital: capital,
                strategy: StrategyConfig {
                    rsi_period,
                    sma_period,
                    rsi_buy_threshold: buy_threshold,
                    rsi_sell_threshold: sell_threshold,
                    rsi_smoothing: parse_smoothing(&smoothing),
                },
                signal_mode: if confirm_macd {
                    SignalMode::TrendWithMacd
                } else {
                    SignalMode::TrendOnly
                },
            };
            cmd_backtest(config, export, no_save).await?;
        }
        Commands::Signal { pair } => {
            cmd_signal(pair).await?;
        }
        Commands::Watch {
            pair,
            poll_secs,
            max_cycles,
        } => {
            cmd_watch(pair, poll_secs, max_cycles).await?;
        }
        Commands::Runs { limit } => {
            cmd_runs(limit).await?;
        }
        Commands::Serve { host, port } => {
            cmd_serve(&host, port).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Backtest command
// ============================================================================

async fn cmd_backtest(
    config: BacktestConfig,
    export: Option<String>,
    no_save: bool,
) -> anyhow::Result<()> {
    println!("\n=== Trend-Signal v{} ===", APP_VERSION);
    println!(
        "Pair: {} | Interval: {} | RSI {} / SMA {} | Thresholds {}/{} | {} | {}",
        config.pair,
        config.interval,
        config.strategy.rsi_period,
        config.strategy.sma_period,
        config.strategy.rsi_buy_threshold,
        config.strategy.rsi_sell_threshold,
        config.strategy.rsi_smoothing,
        config.signal_mode,
    );

    let series = kraken_client()
        .price_series(&config.pair, config.interval)
        .await?;
    println!(
        "Bars: {} ({} to {})",
        series.len(),
        series.bars().first().map(|b| format_time(b.timestamp)).unwrap_or_default(),
        series.last().map(|b| format_time(b.timestamp)).unwrap_or_default(),
    );

    let result = BacktestEngine::run(&config, &series)?;
    print_report(&result);

    if !no_save {
        let (db, path) = open_db().await?;
        let (hash, inserted) = save_result(db.pool(), &result, &series).await?;
        println!(
            "\nRun {} {} ({})",
            &hash[..12],
            if inserted { "saved" } else { "already stored" },
            path
        );
    }

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&export_path, &json)?;
        println!("\nResults exported to {}", export_path);
    }

    Ok(())
}

fn print_report(result: &BacktestResult) {
    let r = &result.report;
    println!("\nBacktest Results:");
    println!("  {:<20} {:>14.2}", "Initial Capital", r.initial_capital);
    println!("  {:<20} {:>14.2}", "Final Capital", r.final_capital);
    println!("  {:<20} {:>13.2}%", "Total Return", r.total_return_pct);
    println!("  {:<20} {:>13.2}%", "Max Drawdown", r.max_drawdown_pct);
    println!("  {:<20} {:>14}", "Total Trades", r.total_trades);
    println!("  {:<20} {:>14}", "Profitable Trades", r.profitable_trades);
    println!("  {:<20} {:>13.2}%", "Win Rate", r.win_rate_pct);

    if result.trades.is_empty() {
        println!("\nNo trades.");
        return;
    }

    println!("\nTrade History:");
    println!("  {:<18} {:<5} {:>14} {:>14}", "Date", "Type", "Price", "Capital");
    println!("  {}", "-".repeat(54));
    for t in &result.trades {
        println!(
            "  {:<18} {:<5} {:>14.2} {:>14.2}",
            format_time(t.timestamp),
            t.kind,
            t.price,
            t.capital_after
        );
    }
}

// ============================================================================
// Signal and watch commands
// ============================================================================

async fn cmd_signal(pair: String) -> anyhow::Result<()> {
    let orchestrator = LiveOrchestrator::new(kraken_client(), orchestrator_config(pair))?;
    let snapshot = orchestrator.snapshot().await?;

    println!("\n=== Trend-Signal v{} ===", APP_VERSION);
    println!("Pair: {}", orchestrator.config().pair);
    println!("Last close: {} at {}", snapshot.price, format_time(snapshot.timestamp));
    println!("  {:<10} {}", "Trend", snapshot.trend);
    println!("  {:<10} {}", "MACD", snapshot.macd);
    println!("  {:<10} {}", "Combined", snapshot.combined);
    Ok(())
}

async fn cmd_watch(pair: String, poll_secs: u64, max_cycles: Option<u64>) -> anyhow::Result<()> {
    let config = OrchestratorConfig {
        poll_interval_secs: poll_secs,
        ..orchestrator_config(pair)
    };
    let orchestrator = LiveOrchestrator::new(kraken_client(), config)?;
    let progress = Arc::new(LiveProgress::new());

    println!("\n=== Trend-Signal v{} ===", APP_VERSION);
    println!(
        "Watching {} every {}s, actions recorded in {}",
        orchestrator.config().pair,
        poll_secs,
        orchestrator.store().path().display()
    );
    println!("Press Ctrl+C to stop\n");

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    run_live(&orchestrator, &SystemClock, &progress, max_cycles).await;

    if let Some(err) = progress.error_message.read().unwrap().clone() {
        println!("Last error: {}", err);
    }
    Ok(())
}

// ============================================================================
// Runs command
// ============================================================================

async fn cmd_runs(limit: i64) -> anyhow::Result<()> {
    let (db, path) = open_db().await?;
    let repo = BacktestRepository::new(db.pool());
    let stats = repo.get_stats().await?;
    let runs = repo.list_recent(limit).await?;

    println!("\n=== Trend-Signal v{} ===", APP_VERSION);
    println!(
        "Database: {} ({} runs, {} pairs, {} trades, best return {}%)",
        path, stats.total_runs, stats.unique_pairs, stats.total_trades, stats.best_return_pct
    );
    if runs.is_empty() {
        println!("\nNo stored runs.");
        return Ok(());
    }

    println!(
        "\n  {:<12} {:<10} {:>6} {:>6} {:>12} {:>10} {:>7} {:>8}",
        "Hash", "Pair", "Int", "Bars", "Return%", "MaxDD%", "Trades", "WR%"
    );
    println!("  {}", "-".repeat(80));
    for r in &runs {
        println!(
            "  {:<12} {:<10} {:>6} {:>6} {:>12} {:>10} {:>7} {:>8}",
            &r.params_hash[..12.min(r.params_hash.len())],
            r.pair,
            r.interval_minutes,
            r.bars,
            r.total_return_pct,
            r.max_drawdown_pct,
            r.total_trades,
            r.win_rate_pct,
        );
    }
    Ok(())
}

// ============================================================================
// Serve command — Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Trend-Signal v{} starting...", APP_VERSION);

    let (db, db_path) = open_db().await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        e
    })?;
    info!("Database initialized: {}", db_path);

    let state = AppState {
        kraken: kraken_client(),
        db: Arc::new(db),
        live_progress: Arc::new(LiveProgress::new()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/backtest", post(api_backtest))
        .route("/backtest/runs", get(api_runs))
        .route("/backtest/runs/:hash/trades", get(api_run_trades))
        .route("/signal", get(api_signal))
        .route("/live/start", post(api_live_start))
        .route("/live/status", get(api_live_status))
        .route("/live/cancel", post(api_live_cancel))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Trend-Signal v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health                      - Health check");
    println!("  POST /api/backtest                    - Run (and store) a backtest");
    println!("  GET  /api/backtest/runs               - Stored runs");
    println!("  GET  /api/backtest/runs/:hash/trades  - Trade ledger of a stored run");
    println!("  GET  /api/signal                      - Current trend and MACD signals");
    println!("  POST /api/live/start                  - Start the live watcher");
    println!("  GET  /api/live/status                 - Poll live watcher progress");
    println!("  POST /api/live/cancel                 - Stop the live watcher");
    println!("\n  Database: {}", db_path);
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// API Handlers — Backtests
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "trend-signal",
        "version": APP_VERSION,
    }))
}

/// POST /api/backtest — fetch data, run, store
async fn api_backtest(
    State(state): State<AppState>,
    Json(config): Json<BacktestConfig>,
) -> Json<serde_json::Value> {
    if let Err(e) = config.validate() {
        return Json(serde_json::json!({
            "success": false,
            "message": e.to_string(),
        }));
    }

    let series = match state
        .kraken
        .price_series(&config.pair, config.interval)
        .await
    {
        Ok(series) => series,
        Err(e) => {
            error!("Kraken OHLC error: {}", e);
            return Json(serde_json::json!({
                "success": false,
                "message": format!("Failed to fetch market data: {}", e),
            }));
        }
    };

    let result = match BacktestEngine::run(&config, &series) {
        Ok(result) => result,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            }))
        }
    };

    match save_result(state.db.pool(), &result, &series).await {
        Ok((hash, inserted)) => Json(serde_json::json!({
            "success": true,
            "params_hash": hash,
            "cached": !inserted,
            "result": result,
        })),
        Err(e) => {
            error!("Failed to store backtest: {}", e);
            Json(serde_json::json!({
                "success": true,
                "params_hash": null,
                "cached": false,
                "result": result,
                "error": format!("Failed to store run: {}", e),
            }))
        }
    }
}

#[derive(Deserialize)]
struct RunsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    20
}

/// GET /api/backtest/runs — recent stored runs plus aggregate stats
async fn api_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Json<serde_json::Value> {
    let repo = BacktestRepository::new(state.db.pool());
    match (repo.list_recent(query.limit).await, repo.get_stats().await) {
        (Ok(runs), Ok(stats)) => Json(serde_json::json!({
            "success": true,
            "data": runs,
            "stats": stats,
        })),
        (Err(e), _) | (_, Err(e)) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query runs: {}", e),
            "data": [],
        })),
    }
}

/// GET /api/backtest/runs/:hash/trades
async fn api_run_trades(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Json<serde_json::Value> {
    let repo = BacktestRepository::new(state.db.pool());
    match repo.get_by_hash(&hash).await {
        Ok(Some(run)) => match repo.get_trades(&hash).await {
            Ok(trades) => Json(serde_json::json!({
                "success": true,
                "run": run,
                "trades": trades,
            })),
            Err(e) => Json(serde_json::json!({
                "success": false,
                "error": format!("Failed to query trades: {}", e),
            })),
        },
        Ok(None) => Json(serde_json::json!({
            "success": false,
            "error": format!("No run with hash {}", hash),
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to query run: {}", e),
        })),
    }
}

// ============================================================================
// API Handlers — Signals and live watcher
// ============================================================================

#[derive(Deserialize)]
struct SignalQuery {
    #[serde(default = "default_pair")]
    pair: String,
}

fn default_pair() -> String {
    "XXBTZUSD".to_string()
}

/// GET /api/signal — evaluate both rules without recording anything
async fn api_signal(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
) -> Json<serde_json::Value> {
    let orchestrator =
        match LiveOrchestrator::new(state.kraken.clone(), orchestrator_config(query.pair)) {
            Ok(o) => o,
            Err(e) => {
                return Json(serde_json::json!({
                    "success": false,
                    "message": e.to_string(),
                }))
            }
        };

    match orchestrator.snapshot().await {
        Ok(snapshot) => Json(serde_json::json!({
            "success": true,
            "pair": orchestrator.config().pair,
            "signal": snapshot,
        })),
        Err(e) => {
            error!("Signal evaluation failed: {}", e);
            Json(serde_json::json!({
                "success": false,
                "message": format!("Failed to evaluate signal: {}", e),
            }))
        }
    }
}

/// POST /api/live/start — start polling in the background
async fn api_live_start(
    State(state): State<AppState>,
    Json(config): Json<OrchestratorConfig>,
) -> Json<serde_json::Value> {
    if state.live_progress.is_running() {
        return Json(serde_json::json!({
            "success": false,
            "message": format!(
                "Live watcher already running ({} cycles)",
                state.live_progress.cycles()
            ),
        }));
    }

    let orchestrator = match LiveOrchestrator::new(state.kraken.clone(), config) {
        Ok(o) => o,
        Err(e) => {
            return Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            }))
        }
    };

    info!(
        pair = %orchestrator.config().pair,
        poll_secs = orchestrator.config().poll_interval_secs,
        "Starting live watcher"
    );

    state.live_progress.reset();
    let progress = state.live_progress.clone();
    tokio::spawn(async move {
        run_live(&orchestrator, &SystemClock, &progress, None).await;
    });

    Json(serde_json::json!({
        "success": true,
        "message": "Live watcher started",
    }))
}

/// GET /api/live/status — poll live watcher progress
async fn api_live_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let progress = &state.live_progress;
    let status = *progress.status.read().unwrap();
    let last_outcome = *progress.last_outcome.read().unwrap();
    let last_cycle_at = *progress.last_cycle_at.read().unwrap();
    let error = progress.error_message.read().unwrap().clone();

    Json(serde_json::json!({
        "status": status,
        "cycles": progress.cycles(),
        "last_outcome": last_outcome,
        "last_cycle_at": last_cycle_at,
        "error": error,
    }))
}

/// POST /api/live/cancel — stop the live watcher
async fn api_live_cancel(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.live_progress.cancel();
    info!("Live watcher cancel requested via API");
    Json(serde_json::json!({
        "success": true,
        "message": "Cancel requested"
    }))
}
