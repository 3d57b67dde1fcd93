//! Trend Signal Engine — indicators, signal rules, and backtesting
//!
//! Provides:
//! - SMA, Wilder RSI, EMA and MACD, both batch and incremental
//! - The SMA-gated RSI trend rule and the MACD crossover rule
//! - A bar-by-bar long-only backtest simulator with a linked trade ledger
//! - A live orchestrator that acts once per confirmed signal
//! - Kraken public API client for market data

pub mod api;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod orchestrator;
pub mod record;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use api::{KrakenClient, MarketData};
pub use engine::BacktestEngine;
pub use error::{EngineError, EngineResult};
pub use orchestrator::{
    run_live, Action, ActionStore, Clock, CycleOutcome, LastAction, LiveOrchestrator,
    LiveProgress, LiveStatus, OrchestratorConfig, SignalSnapshot, SystemClock,
};
pub use record::{compute_params_hash, result_to_records, save_result};
pub use strategy::{
    confirm, latest_trend_signal, macd_crossover, trend_signal, MacdCrossover, MacdDecision,
    Signal, TrendRsiStrategy,
};
pub use types::*;
