//! Types for the signal engine and backtest simulator

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// A full OHLC bar as returned by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ohlc {
    pub time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub vwap: Decimal,
    pub volume: Decimal,
    pub count: u64,
}

impl Ohlc {
    /// Reduce to the two fields the engine consumes
    pub fn to_price_bar(&self) -> Option<PriceBar> {
        Some(PriceBar {
            timestamp: self.time,
            close: self.close.to_f64()?,
        })
    }
}

/// Close price at a point in time (epoch seconds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: i64,
    pub close: f64,
}

/// Close-price history with strictly increasing timestamps and finite,
/// positive closes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PriceBar>", into = "Vec<PriceBar>")]
pub struct PriceSeries {
    bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(bars: Vec<PriceBar>) -> EngineResult<Self> {
        if let Some((index, bar)) = bars
            .iter()
            .enumerate()
            .find(|(_, b)| !b.close.is_finite() || b.close <= 0.0)
        {
            return Err(EngineError::InvalidPrice {
                index,
                close: bar.close,
            });
        }
        for (index, pair) in bars.windows(2).enumerate() {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(EngineError::UnorderedSeries {
                    index: index + 1,
                    previous: pair[0].timestamp,
                    current: pair[1].timestamp,
                });
            }
        }
        Ok(Self { bars })
    }

    /// Build a series from bare closes, spacing timestamps `step` seconds apart
    pub fn from_closes(closes: &[f64], start: i64, step: i64) -> EngineResult<Self> {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PriceBar {
                timestamp: start + i as i64 * step,
                close,
            })
            .collect();
        Self::new(bars)
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&PriceBar> {
        self.bars.last()
    }

    /// The trailing `n` bars (all of them if the series is shorter)
    pub fn tail(&self, n: usize) -> PriceSeries {
        let start = self.bars.len().saturating_sub(n);
        Self {
            bars: self.bars[start..].to_vec(),
        }
    }
}

impl TryFrom<Vec<PriceBar>> for PriceSeries {
    type Error = EngineError;

    fn try_from(bars: Vec<PriceBar>) -> EngineResult<Self> {
        Self::new(bars)
    }
}

impl From<PriceSeries> for Vec<PriceBar> {
    fn from(series: PriceSeries) -> Self {
        series.bars
    }
}

/// Bar interval in minutes, restricted to what the exchange serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Interval(u32);

impl Interval {
    pub const SUPPORTED: [u32; 9] = [1, 5, 15, 30, 60, 240, 1440, 10080, 21600];

    pub const FIVE_MINUTES: Interval = Interval(5);
    pub const FOUR_HOURS: Interval = Interval(240);
    pub const DAILY: Interval = Interval(1440);

    pub fn from_minutes(minutes: u32) -> EngineResult<Self> {
        if Self::SUPPORTED.contains(&minutes) {
            Ok(Self(minutes))
        } else {
            Err(EngineError::InvalidInterval(minutes))
        }
    }

    pub fn minutes(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Interval {
    type Error = EngineError;

    fn try_from(minutes: u32) -> EngineResult<Self> {
        Self::from_minutes(minutes)
    }
}

impl From<Interval> for u32 {
    fn from(interval: Interval) -> Self {
        interval.0
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

/// How RSI smoothing state is derived at each evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RsiSmoothing {
    /// One Wilder state carried across the whole series, O(1) per bar
    #[default]
    Continuous,
    /// Re-seeded from a fixed `rsi_period + 2` window anchored at each bar
    Windowed,
}

impl fmt::Display for RsiSmoothing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RsiSmoothing::Continuous => write!(f, "continuous"),
            RsiSmoothing::Windowed => write!(f, "windowed"),
        }
    }
}

/// Indicator parameters for the trend/momentum rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// RSI lookback (default: 10)
    pub rsi_period: usize,
    /// Trend filter SMA lookback (default: 200)
    pub sma_period: usize,
    /// Buy when RSI falls below this inside an uptrend (default: 30)
    pub rsi_buy_threshold: f64,
    /// Take profit when RSI rises above this inside an uptrend (default: 40)
    pub rsi_sell_threshold: f64,
    pub rsi_smoothing: RsiSmoothing,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            rsi_period: 10,
            sma_period: 200,
            rsi_buy_threshold: 30.0,
            rsi_sell_threshold: 40.0,
            rsi_smoothing: RsiSmoothing::Continuous,
        }
    }
}

impl StrategyConfig {
    /// Bars that must precede an evaluation index before it may signal
    pub fn warmup(&self) -> usize {
        self.sma_period + self.rsi_period
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.rsi_period == 0 || self.sma_period == 0 {
            return Err(EngineError::InvalidConfig(format!(
                "periods must be positive (rsi_period={}, sma_period={})",
                self.rsi_period, self.sma_period
            )));
        }
        let in_range = |t: f64| (0.0..=100.0).contains(&t);
        if !in_range(self.rsi_buy_threshold) || !in_range(self.rsi_sell_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "RSI thresholds must lie in [0, 100] (buy={}, sell={})",
                self.rsi_buy_threshold, self.rsi_sell_threshold
            )));
        }
        if self.rsi_buy_threshold > self.rsi_sell_threshold {
            return Err(EngineError::InvalidConfig(format!(
                "buy threshold {} above sell threshold {}",
                self.rsi_buy_threshold, self.rsi_sell_threshold
            )));
        }
        Ok(())
    }
}

/// Which rules must agree before the simulator acts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalMode {
    #[default]
    TrendOnly,
    /// Trend signal confirmed by a MACD crossover on the same bar, as the live loop does
    TrendWithMacd,
}

impl fmt::Display for SignalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalMode::TrendOnly => write!(f, "trend_only"),
            SignalMode::TrendWithMacd => write!(f, "trend_with_macd"),
        }
    }
}

/// Configuration for a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub pair: String,
    pub interval: Interval,
    pub initial_capital: f64,
    pub strategy: StrategyConfig,
    pub signal_mode: SignalMode,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            pair: "XXBTZUSD".to_string(),
            interval: Interval::DAILY,
            initial_capital: 10_000.0,
            strategy: StrategyConfig::default(),
            signal_mode: SignalMode::TrendOnly,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(EngineError::InvalidConfig(format!(
                "initial capital must be positive, got {}",
                self.initial_capital
            )));
        }
        self.strategy.validate()
    }
}

/// Side of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeKind {
    Buy,
    Sell,
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeKind::Buy => write!(f, "BUY"),
            TradeKind::Sell => write!(f, "SELL"),
        }
    }
}

/// A single ledger entry. The BUY that opens a position and the SELL that
/// closes it share a `position_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub position_id: u64,
    pub kind: TradeKind,
    pub price: f64,
    pub timestamp: i64,
    pub position_size: f64,
    pub capital_after: f64,
}

/// The open long position, if any
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub id: u64,
    pub size: f64,
    pub entry_price: f64,
}

/// A point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
}

/// Performance summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub initial_capital: f64,
    pub final_capital: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: usize,
    pub profitable_trades: usize,
    pub win_rate_pct: f64,
}

/// Result of a backtest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: BacktestConfig,
    pub report: Report,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub start_time: i64,
    pub end_time: i64,
    pub bars: usize,
}
