//! Signal rules: the SMA-gated RSI trend rule and the MACD crossover detector
//!
//! The two rules are independent. Callers that need both to agree combine
//! them with [`confirm`].

use serde::{Deserialize, Serialize};
use std::fmt;
use ta::{Next, Reset};

use crate::error::EngineResult;
use crate::indicators::{self, Macd, Sma, WilderRsi};
use crate::types::{RsiSmoothing, StrategyConfig};

/// Trailing closes handed to the MACD rule by default
pub const MACD_WINDOW: usize = 60;
/// 26 bars for the slow EMA plus 8 more to seed the 9-bar signal line
pub const MACD_MIN_BARS: usize = 34;

/// Trading signal emitted per evaluation point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Buy,
    TakeProfit,
    Hold,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::TakeProfit => write!(f, "TAKE_PROFIT"),
            Signal::Hold => write!(f, "HOLD"),
        }
    }
}

fn classify(close: f64, sma: f64, rsi: f64, config: &StrategyConfig) -> Signal {
    // Outside an uptrend the rule never signals, whatever RSI says
    if close <= sma {
        return Signal::Hold;
    }
    if rsi < config.rsi_buy_threshold {
        Signal::Buy
    } else if rsi > config.rsi_sell_threshold {
        Signal::TakeProfit
    } else {
        Signal::Hold
    }
}

// ============================================================================
// Trend/momentum rule
// ============================================================================

/// Evaluate the trend rule at index `i`, re-deriving both indicators from
/// windows anchored at `i`.
///
/// The SMA covers the `sma_period` closes before `i`; RSI covers the
/// `rsi_period + 2` closes ending at `i`.
pub fn trend_signal(closes: &[f64], i: usize, config: &StrategyConfig) -> Signal {
    if i < config.warmup() || i >= closes.len() {
        return Signal::Hold;
    }

    let sma = indicators::sma(&closes[i - config.sma_period..i], config.sma_period);
    let rsi = indicators::rsi(&closes[i - config.rsi_period - 1..=i], config.rsi_period);
    classify(closes[i], sma, rsi, config)
}

/// The trend rule carried bar by bar: one SMA and one Wilder RSI state,
/// each updated once per close.
pub struct TrendRsiStrategy {
    config: StrategyConfig,
    sma: Sma,
    rsi: WilderRsi,
    /// SMA over the closes strictly before the current bar
    prior_sma: Option<f64>,
    bars_seen: usize,
}

impl TrendRsiStrategy {
    pub fn new(config: &StrategyConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            sma: Sma::new(config.sma_period)?,
            rsi: WilderRsi::new(config.rsi_period)?,
            prior_sma: None,
            bars_seen: 0,
        })
    }

    pub fn on_bar(&mut self, close: f64) -> Signal {
        let index = self.bars_seen;
        self.bars_seen += 1;

        let rsi = self.rsi.next(close);
        let sma = std::mem::replace(&mut self.prior_sma, self.sma.next(close));

        if index < self.config.warmup() {
            return Signal::Hold;
        }
        match (sma, rsi) {
            (Some(sma), Some(rsi)) => classify(close, sma, rsi, &self.config),
            _ => Signal::Hold,
        }
    }

    pub fn reset(&mut self) {
        self.sma.reset();
        self.rsi.reset();
        self.prior_sma = None;
        self.bars_seen = 0;
    }
}

/// Trend signal at the last close of `closes`, using the configured smoothing.
pub fn latest_trend_signal(closes: &[f64], config: &StrategyConfig) -> EngineResult<Signal> {
    let Some(last) = closes.len().checked_sub(1) else {
        return Ok(Signal::Hold);
    };
    match config.rsi_smoothing {
        RsiSmoothing::Windowed => {
            config.validate()?;
            Ok(trend_signal(closes, last, config))
        }
        RsiSmoothing::Continuous => {
            let mut strategy = TrendRsiStrategy::new(config)?;
            Ok(closes
                .iter()
                .map(|&c| strategy.on_bar(c))
                .last()
                .unwrap_or(Signal::Hold))
        }
    }
}

// ============================================================================
// MACD crossover rule
// ============================================================================

/// Outcome of the MACD rule; too little history is a normal state, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdDecision {
    Signal(Signal),
    InsufficientData,
}

impl MacdDecision {
    pub fn signal(self) -> Signal {
        match self {
            MacdDecision::Signal(s) => s,
            MacdDecision::InsufficientData => Signal::Hold,
        }
    }
}

impl fmt::Display for MacdDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacdDecision::Signal(s) => write!(f, "{s}"),
            MacdDecision::InsufficientData => write!(f, "INSUFFICIENT_DATA"),
        }
    }
}

/// Equality counts as "not yet crossed" before and "not crossed" now.
fn crossover(prev_macd: f64, prev_signal: f64, macd: f64, signal: f64) -> Signal {
    if prev_macd <= prev_signal && macd > signal {
        Signal::Buy
    } else if prev_macd >= prev_signal && macd < signal {
        Signal::TakeProfit
    } else {
        Signal::Hold
    }
}

/// Detect a MACD/signal-line crossover on the last bar of `window`.
pub fn macd_crossover(window: &[f64]) -> MacdDecision {
    if window.len() < MACD_MIN_BARS {
        return MacdDecision::InsufficientData;
    }

    let lines = indicators::macd(window);
    let (m, s) = (&lines.macd, &lines.signal);
    if m.len() < 2 || s.len() < 2 {
        return MacdDecision::InsufficientData;
    }

    // Both lines end on the last close, so their last two points line up
    MacdDecision::Signal(crossover(
        m[m.len() - 2],
        s[s.len() - 2],
        m[m.len() - 1],
        s[s.len() - 1],
    ))
}

/// The MACD rule carried bar by bar over an unbounded history.
pub struct MacdCrossover {
    macd: Macd,
    prev: Option<(f64, f64)>,
}

impl Default for MacdCrossover {
    fn default() -> Self {
        Self::new()
    }
}

impl MacdCrossover {
    pub fn new() -> Self {
        Self {
            macd: Macd::standard(),
            prev: None,
        }
    }

    pub fn on_bar(&mut self, close: f64) -> MacdDecision {
        let Some(indicators::MacdPoint {
            macd,
            signal: Some(signal),
        }) = self.macd.next(close)
        else {
            return MacdDecision::InsufficientData;
        };

        match self.prev.replace((macd, signal)) {
            Some((prev_macd, prev_signal)) => {
                MacdDecision::Signal(crossover(prev_macd, prev_signal, macd, signal))
            }
            None => MacdDecision::InsufficientData,
        }
    }

    pub fn reset(&mut self) {
        self.macd.reset();
        self.prev = None;
    }
}

/// Act only when the trend rule and the MACD rule say the same thing.
pub fn confirm(trend: Signal, macd: MacdDecision) -> Signal {
    match (trend, macd) {
        (Signal::Hold, _) => Signal::Hold,
        (t, MacdDecision::Signal(m)) if t == m => t,
        _ => Signal::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// 200 flat bars, a crash, a jump, a slow pullback and a recovery.
    fn dip_and_recovery() -> Vec<f64> {
        let mut closes = vec![100.0; 200];
        closes.extend([60.0, 73.0, 72.5, 72.0, 71.5, 71.0, 90.0, 100.0, 110.0]);
        closes.extend([110.0; 7]);
        closes
    }

    fn small(smoothing: RsiSmoothing) -> StrategyConfig {
        StrategyConfig {
            rsi_period: 3,
            sma_period: 5,
            rsi_smoothing: smoothing,
            ..Default::default()
        }
    }

    fn streamed(closes: &[f64], config: &StrategyConfig) -> Vec<Signal> {
        let mut strategy = TrendRsiStrategy::new(config).unwrap();
        closes.iter().map(|&c| strategy.on_bar(c)).collect()
    }

    #[test]
    fn test_hold_during_warmup() {
        let config = small(RsiSmoothing::Windowed);
        let closes = dip_and_recovery();
        for i in 0..config.warmup() {
            assert_eq!(trend_signal(&closes, i, &config), Signal::Hold);
        }
        assert_eq!(trend_signal(&closes, closes.len(), &config), Signal::Hold);
    }

    #[test]
    fn test_windowed_rule_buys_the_pullback_and_takes_profit() {
        let config = small(RsiSmoothing::Windowed);
        let closes = dip_and_recovery();

        // Still under the falling SMA while the crash works through it
        for i in 200..205 {
            assert_eq!(trend_signal(&closes, i, &config), Signal::Hold, "bar {i}");
        }
        assert_eq!(trend_signal(&closes, 205, &config), Signal::Buy);
        assert_eq!(trend_signal(&closes, 206, &config), Signal::TakeProfit);
    }

    #[test]
    fn test_streamed_rule_matches_on_the_scenario() {
        let closes = dip_and_recovery();
        let signals = streamed(&closes, &small(RsiSmoothing::Continuous));

        let buys: Vec<usize> = (0..signals.len())
            .filter(|&i| signals[i] == Signal::Buy)
            .collect();
        assert_eq!(buys, vec![205]);
        assert_eq!(signals[206], Signal::TakeProfit);
        assert!(signals[..205].iter().all(|s| *s == Signal::Hold));
    }

    #[test]
    fn test_flat_market_after_long_history_holds() {
        let config = small(RsiSmoothing::Continuous);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut price = 1_000.0;
            let mut closes: Vec<f64> = (0..2_000)
                .map(|_| {
                    price *= 1.0 + rng.gen_range(-0.05..0.05);
                    price
                })
                .collect();
            closes.extend(vec![price; 300]);

            let signals = streamed(&closes, &config);
            let flat_from = 2_000 + config.sma_period;
            for i in flat_from..closes.len() {
                assert_eq!(signals[i], Signal::Hold, "seed {seed} bar {i}");
                assert_eq!(trend_signal(&closes, i, &config), Signal::Hold, "seed {seed} bar {i}");
            }
        }
    }

    #[test]
    fn test_downtrend_never_signals() {
        let closes: Vec<f64> = (0..80).map(|i| 200.0 - i as f64 * 1.5).collect();
        for smoothing in [RsiSmoothing::Windowed, RsiSmoothing::Continuous] {
            let config = small(smoothing);
            assert!(streamed(&closes, &config).iter().all(|s| *s == Signal::Hold));
            assert!((0..closes.len()).all(|i| trend_signal(&closes, i, &config) == Signal::Hold));
        }
    }

    #[test]
    fn test_latest_trend_signal_uses_configured_smoothing() {
        let closes = dip_and_recovery();
        for smoothing in [RsiSmoothing::Windowed, RsiSmoothing::Continuous] {
            let config = small(smoothing);
            assert_eq!(latest_trend_signal(&closes[..=205], &config), Ok(Signal::Buy));
            assert_eq!(latest_trend_signal(&closes[..=206], &config), Ok(Signal::TakeProfit));
        }
        assert_eq!(latest_trend_signal(&[], &StrategyConfig::default()), Ok(Signal::Hold));
    }

    #[test]
    fn test_custom_thresholds_change_the_decision() {
        let closes = dip_and_recovery();
        // Windowed RSI at bar 206 is 95; a sell threshold above that turns it into a hold
        let config = StrategyConfig {
            rsi_sell_threshold: 99.0,
            ..small(RsiSmoothing::Windowed)
        };
        assert_eq!(trend_signal(&closes, 206, &config), Signal::Hold);
    }

    #[test]
    fn test_reset_replays_identically() {
        let closes = dip_and_recovery();
        let mut strategy = TrendRsiStrategy::new(&small(RsiSmoothing::Continuous)).unwrap();
        let first: Vec<Signal> = closes.iter().map(|&c| strategy.on_bar(c)).collect();
        strategy.reset();
        let second: Vec<Signal> = closes.iter().map(|&c| strategy.on_bar(c)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_macd_bullish_crossover_from_flat() {
        let mut closes = vec![100.0; 40];
        closes.push(110.0);
        assert_eq!(macd_crossover(&closes), MacdDecision::Signal(Signal::Buy));
    }

    #[test]
    fn test_macd_bearish_crossover_from_flat() {
        let mut closes = vec![100.0; 40];
        closes.push(90.0);
        assert_eq!(macd_crossover(&closes), MacdDecision::Signal(Signal::TakeProfit));
    }

    #[test]
    fn test_macd_ties_never_signal() {
        assert_eq!(macd_crossover(&[100.0; 60]), MacdDecision::Signal(Signal::Hold));
    }

    #[test]
    fn test_macd_insufficient_data() {
        assert_eq!(macd_crossover(&[100.0; 33]), MacdDecision::InsufficientData);
        // 34 closes give a single signal point, one short of a crossover check
        assert_eq!(macd_crossover(&[100.0; 34]), MacdDecision::InsufficientData);
        assert_eq!(macd_crossover(&[100.0; 35]), MacdDecision::Signal(Signal::Hold));
        assert_eq!(MacdDecision::InsufficientData.signal(), Signal::Hold);
    }

    #[test]
    fn test_streamed_macd_agrees_with_batch() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut price = 100.0;
        let closes: Vec<f64> = (0..MACD_WINDOW)
            .map(|_| {
                price *= 1.0 + rng.gen_range(-0.04..0.04);
                price
            })
            .collect();

        let mut live = MacdCrossover::new();
        for end in 1..=closes.len() {
            let streamed = live.on_bar(closes[end - 1]);
            assert_eq!(streamed, macd_crossover(&closes[..end]), "bar {}", end - 1);
        }
    }

    #[test]
    fn test_confirm_requires_agreement() {
        use MacdDecision::{InsufficientData, Signal as M};
        assert_eq!(confirm(Signal::Buy, M(Signal::Buy)), Signal::Buy);
        assert_eq!(confirm(Signal::TakeProfit, M(Signal::TakeProfit)), Signal::TakeProfit);
        assert_eq!(confirm(Signal::Buy, M(Signal::TakeProfit)), Signal::Hold);
        assert_eq!(confirm(Signal::Buy, M(Signal::Hold)), Signal::Hold);
        assert_eq!(confirm(Signal::Buy, InsufficientData), Signal::Hold);
        assert_eq!(confirm(Signal::Hold, M(Signal::Buy)), Signal::Hold);
    }

    #[test]
    fn test_signal_wire_names() {
        assert_eq!(serde_json::to_string(&Signal::TakeProfit).unwrap(), "\"TAKE_PROFIT\"");
        assert_eq!(Signal::TakeProfit.to_string(), "TAKE_PROFIT");
    }
}
