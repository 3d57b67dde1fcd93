//! Conversion of backtest results to storage records

use persistence::repository::{BacktestRepository, BacktestRunRecord, BacktestTradeRecord};
use persistence::{DbResult, SqlitePool};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::types::{BacktestConfig, BacktestResult, PriceSeries};

/// Deterministic key for a (config, data) pair. A backtest is a pure function
/// of both, so equal hashes mean equal results.
pub fn compute_params_hash(config: &BacktestConfig, series: &PriceSeries) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_string(config).unwrap_or_default().as_bytes());
    for bar in series.bars() {
        hasher.update(format!("|{}:{}", bar.timestamp, bar.close).as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn money(value: f64) -> String {
    Decimal::from_f64(value)
        .map(|d| d.normalize().to_string())
        .unwrap_or_else(|| value.to_string())
}

pub fn result_to_records(
    result: &BacktestResult,
    hash: &str,
) -> (BacktestRunRecord, Vec<BacktestTradeRecord>) {
    let report = &result.report;
    let config = &result.config;

    let run = BacktestRunRecord {
        id: None,
        params_hash: hash.to_string(),
        pair: config.pair.clone(),
        interval_minutes: config.interval.minutes() as i64,
        strategy_params: serde_json::to_string(&config.strategy).unwrap_or_default(),
        initial_capital: money(report.initial_capital),
        final_capital: money(report.final_capital),
        total_return_pct: money(report.total_return_pct),
        max_drawdown_pct: money(report.max_drawdown_pct),
        total_trades: report.total_trades as i64,
        profitable_trades: report.profitable_trades as i64,
        win_rate_pct: money(report.win_rate_pct),
        bars: result.bars as i64,
        start_time: result.start_time,
        end_time: result.end_time,
        created_at: None,
        rsi_smoothing: Some(config.strategy.rsi_smoothing.to_string()),
        signal_mode: Some(config.signal_mode.to_string()),
    };

    let trades = result
        .trades
        .iter()
        .enumerate()
        .map(|(seq, t)| BacktestTradeRecord {
            id: None,
            params_hash: hash.to_string(),
            seq: seq as i64,
            position_id: t.position_id as i64,
            kind: t.kind.to_string(),
            price: money(t.price),
            timestamp: t.timestamp,
            position_size: money(t.position_size),
            capital_after: money(t.capital_after),
        })
        .collect();

    (run, trades)
}

/// Store a result keyed by its params hash. Returns the hash and whether a
/// new row was written.
pub async fn save_result(
    pool: &SqlitePool,
    result: &BacktestResult,
    series: &PriceSeries,
) -> DbResult<(String, bool)> {
    let hash = compute_params_hash(&result.config, series);
    let (run, trades) = result_to_records(result, &hash);
    let inserted = BacktestRepository::new(pool).save_run(&run, &trades).await?;
    info!(hash = %&hash[..12], inserted, trades = trades.len(), "Saved backtest run");
    Ok((hash, inserted))
}
