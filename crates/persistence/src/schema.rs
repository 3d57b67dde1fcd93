//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Final report of one backtest run
CREATE TABLE IF NOT EXISTS backtest_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    pair TEXT NOT NULL,
    interval_minutes INTEGER NOT NULL,
    strategy_params TEXT NOT NULL,
    initial_capital TEXT NOT NULL,
    final_capital TEXT NOT NULL,
    total_return_pct TEXT NOT NULL DEFAULT '0',
    max_drawdown_pct TEXT NOT NULL DEFAULT '0',
    total_trades INTEGER NOT NULL DEFAULT 0,
    profitable_trades INTEGER NOT NULL DEFAULT 0,
    win_rate_pct TEXT NOT NULL DEFAULT '0',
    bars INTEGER NOT NULL DEFAULT 0,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    rsi_smoothing TEXT,
    signal_mode TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Append-only trade ledger, one row per BUY/SELL
CREATE TABLE IF NOT EXISTS backtest_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL REFERENCES backtest_runs(params_hash) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    position_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    price TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    position_size TEXT NOT NULL,
    capital_after TEXT NOT NULL,
    UNIQUE(params_hash, seq)
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_runs_pair ON backtest_runs(pair, interval_minutes);
CREATE INDEX IF NOT EXISTS idx_runs_created ON backtest_runs(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_trades_run ON backtest_trades(params_hash, seq)
"#;
