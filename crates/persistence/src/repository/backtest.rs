//! Backtest runs repository — stored reports and their trade ledgers

use crate::{DbError, DbResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::debug;

/// Final report of a single backtest run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub pair: String,
    pub interval_minutes: i64,
    pub strategy_params: String,
    pub initial_capital: String,
    pub final_capital: String,
    pub total_return_pct: String,
    pub max_drawdown_pct: String,
    pub total_trades: i64,
    pub profitable_trades: i64,
    pub win_rate_pct: String,
    pub bars: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub created_at: Option<i64>,
    pub rsi_smoothing: Option<String>,
    pub signal_mode: Option<String>,
}

/// One ledger entry belonging to a stored run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestTradeRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub seq: i64,
    pub position_id: i64,
    pub kind: String,
    pub price: String,
    pub timestamp: i64,
    pub position_size: String,
    pub capital_after: String,
}

/// Aggregated stats across all stored runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestStats {
    pub total_runs: i64,
    pub unique_pairs: i64,
    pub total_trades: i64,
    pub best_return_pct: String,
    pub best_run_hash: Option<String>,
}

const RUN_COLUMNS: &str = r#"
    id, params_hash, pair, interval_minutes, strategy_params,
    initial_capital, final_capital, total_return_pct, max_drawdown_pct,
    total_trades, profitable_trades, win_rate_pct,
    bars, start_time, end_time, created_at,
    rsi_smoothing, signal_mode
"#;

/// Repository for backtest reports
pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a run and its ledger in one transaction.
    ///
    /// Returns `false` when a run with the same `params_hash` is already stored;
    /// the existing ledger is left untouched in that case.
    pub async fn save_run(
        &self,
        run: &BacktestRunRecord,
        trades: &[BacktestTradeRecord],
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO backtest_runs (
                params_hash, pair, interval_minutes, strategy_params,
                initial_capital, final_capital, total_return_pct, max_drawdown_pct,
                total_trades, profitable_trades, win_rate_pct,
                bars, start_time, end_time, created_at,
                rsi_smoothing, signal_mode
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.params_hash)
        .bind(&run.pair)
        .bind(run.interval_minutes)
        .bind(&run.strategy_params)
        .bind(&run.initial_capital)
        .bind(&run.final_capital)
        .bind(&run.total_return_pct)
        .bind(&run.max_drawdown_pct)
        .bind(run.total_trades)
        .bind(run.profitable_trades)
        .bind(&run.win_rate_pct)
        .bind(run.bars)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.created_at.unwrap_or_else(|| chrono::Utc::now().timestamp()))
        .bind(&run.rsi_smoothing)
        .bind(&run.signal_mode)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            debug!(hash = %run.params_hash, "Run already stored, skipping");
            return Ok(false);
        }

        for trade in trades {
            if trade.params_hash != run.params_hash {
                return Err(DbError::Query(format!(
                    "trade seq {} belongs to run {}, not {}",
                    trade.seq, trade.params_hash, run.params_hash
                )));
            }
            sqlx::query(
                r#"
                INSERT INTO backtest_trades (
                    params_hash, seq, position_id, kind, price,
                    timestamp, position_size, capital_after
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&trade.params_hash)
            .bind(trade.seq)
            .bind(trade.position_id)
            .bind(&trade.kind)
            .bind(&trade.price)
            .bind(trade.timestamp)
            .bind(&trade.position_size)
            .bind(&trade.capital_after)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(hash = %run.params_hash, trades = trades.len(), "Run stored");
        Ok(true)
    }

    /// Check if a run with this params_hash already exists
    pub async fn exists_by_hash(&self, hash: &str) -> DbResult<bool> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_runs WHERE params_hash = ?")
            .bind(hash)
            .fetch_one(self.pool)
            .await?;

        Ok(row.0 > 0)
    }

    /// Get a run by its params_hash
    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<BacktestRunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM backtest_runs WHERE params_hash = ?");
        let record = sqlx::query_as::<_, BacktestRunRecord>(&sql)
            .bind(hash)
            .fetch_optional(self.pool)
            .await?;

        Ok(record)
    }

    /// Most recently stored runs first
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<BacktestRunRecord>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM backtest_runs ORDER BY created_at DESC, id DESC LIMIT ?"
        );
        let records = sqlx::query_as::<_, BacktestRunRecord>(&sql)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        Ok(records)
    }

    /// Ledger of a stored run, in the order the trades were made
    pub async fn get_trades(&self, hash: &str) -> DbResult<Vec<BacktestTradeRecord>> {
        let records = sqlx::query_as::<_, BacktestTradeRecord>(
            r#"
            SELECT id, params_hash, seq, position_id, kind, price,
                   timestamp, position_size, capital_after
            FROM backtest_trades
            WHERE params_hash = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(hash)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Aggregate stats. Returns are stored as TEXT, so the best one is picked
    /// after parsing rather than with ORDER BY.
    pub async fn get_stats(&self) -> DbResult<BacktestStats> {
        let (total_runs, unique_pairs, total_trades): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT pair), COALESCE(SUM(total_trades), 0) FROM backtest_runs",
        )
        .fetch_one(self.pool)
        .await?;

        let returns: Vec<(String, String)> =
            sqlx::query_as("SELECT params_hash, total_return_pct FROM backtest_runs")
                .fetch_all(self.pool)
                .await?;

        let best = returns
            .into_iter()
            .filter_map(|(hash, ret)| Decimal::from_str(&ret).ok().map(|d| (hash, d)))
            .max_by(|a, b| a.1.cmp(&b.1));

        Ok(BacktestStats {
            total_runs,
            unique_pairs,
            total_trades,
            best_return_pct: best
                .as_ref()
                .map(|(_, d)| d.to_string())
                .unwrap_or_else(|| "0".to_string()),
            best_run_hash: best.map(|(hash, _)| hash),
        })
    }

    /// Delete a run; its trades go with it via ON DELETE CASCADE
    pub async fn delete_run(&self, hash: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM backtest_runs WHERE params_hash = ?")
            .bind(hash)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
