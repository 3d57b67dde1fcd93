//! Bar-by-bar backtesting engine

use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::strategy::{confirm, trend_signal, MacdCrossover, Signal, TrendRsiStrategy};
use crate::types::*;

/// Produces the signal for each bar, in order, starting at bar 0.
///
/// Every bar is fed so streamed indicators warm up on the full history,
/// including bars the simulator does not trade on.
struct SignalFeed<'a> {
    config: &'a StrategyConfig,
    closes: &'a [f64],
    streamed: Option<TrendRsiStrategy>,
    macd: Option<MacdCrossover>,
}

impl<'a> SignalFeed<'a> {
    fn new(config: &'a BacktestConfig, closes: &'a [f64]) -> EngineResult<Self> {
        let streamed = match config.strategy.rsi_smoothing {
            RsiSmoothing::Continuous => Some(TrendRsiStrategy::new(&config.strategy)?),
            RsiSmoothing::Windowed => None,
        };
        let macd = match config.signal_mode {
            SignalMode::TrendOnly => None,
            SignalMode::TrendWithMacd => Some(MacdCrossover::new()),
        };
        Ok(Self {
            config: &config.strategy,
            closes,
            streamed,
            macd,
        })
    }

    fn signal_at(&mut self, i: usize) -> Signal {
        let close = self.closes[i];
        let trend = match self.streamed.as_mut() {
            Some(strategy) => strategy.on_bar(close),
            None => trend_signal(self.closes, i, self.config),
        };
        match self.macd.as_mut() {
            Some(macd) => confirm(trend, macd.on_bar(close)),
            None => trend,
        }
    }
}

/// Capital, position and ledger for one run
struct BacktestState {
    capital: f64,
    position: Option<Position>,
    peak_capital: f64,
    max_drawdown: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    next_position_id: u64,
}

impl BacktestState {
    fn new(initial_capital: f64) -> Self {
        Self {
            capital: initial_capital,
            position: None,
            peak_capital: initial_capital,
            max_drawdown: 0.0,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            next_position_id: 1,
        }
    }

    /// Go all-in at the bar's close. Capital is left as is; it only changes on a SELL.
    fn open(&mut self, bar: &PriceBar) {
        let position = Position {
            id: self.next_position_id,
            size: self.capital / bar.close,
            entry_price: bar.close,
        };
        self.next_position_id += 1;

        self.trades.push(Trade {
            position_id: position.id,
            kind: TradeKind::Buy,
            price: bar.close,
            timestamp: bar.timestamp,
            position_size: position.size,
            capital_after: self.capital,
        });
        self.position = Some(position);

        debug!(
            price = bar.close,
            size = position.size,
            time = bar.timestamp,
            "Opened LONG position"
        );
    }

    fn close(&mut self, position: Position, bar: &PriceBar) {
        self.capital = position.size * bar.close;
        self.trades.push(Trade {
            position_id: position.id,
            kind: TradeKind::Sell,
            price: bar.close,
            timestamp: bar.timestamp,
            position_size: position.size,
            capital_after: self.capital,
        });
        self.position = None;

        debug!(
            entry = position.entry_price,
            exit = bar.close,
            capital = self.capital,
            "Closed position"
        );
    }

    fn value_at(&self, price: f64) -> f64 {
        match self.position {
            Some(pos) => pos.size * price,
            None => self.capital,
        }
    }

    fn mark(&mut self, bar: &PriceBar) {
        let value = self.value_at(bar.close);
        self.peak_capital = self.peak_capital.max(value);
        let drawdown = (self.peak_capital - value) / self.peak_capital;
        self.max_drawdown = self.max_drawdown.max(drawdown);
        self.equity_curve.push(EquityPoint {
            timestamp: bar.timestamp,
            equity: value,
        });
    }
}

/// Closed BUY/SELL pairs and how many of them sold above their entry
fn pair_stats(trades: &[Trade]) -> (usize, usize) {
    let entries: HashMap<u64, f64> = trades
        .iter()
        .filter(|t| t.kind == TradeKind::Buy)
        .map(|t| (t.position_id, t.price))
        .collect();

    trades
        .iter()
        .filter(|t| t.kind == TradeKind::Sell)
        .filter_map(|exit| entries.get(&exit.position_id).map(|entry| exit.price > *entry))
        .fold((0, 0), |(closed, won), profitable| {
            (closed + 1, won + usize::from(profitable))
        })
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest over `series`. The result depends only on the inputs.
    pub fn run(config: &BacktestConfig, series: &PriceSeries) -> EngineResult<BacktestResult> {
        config.validate()?;

        let closes = series.closes();
        let mut feed = SignalFeed::new(config, &closes)?;
        let mut state = BacktestState::new(config.initial_capital);

        info!(
            pair = %config.pair,
            interval = %config.interval,
            bars = series.len(),
            capital = config.initial_capital,
            rsi_period = config.strategy.rsi_period,
            sma_period = config.strategy.sma_period,
            smoothing = %config.strategy.rsi_smoothing,
            mode = %config.signal_mode,
            "Starting backtest"
        );

        for (i, bar) in series.bars().iter().enumerate() {
            let signal = feed.signal_at(i);
            if i < config.strategy.sma_period {
                continue;
            }

            match (signal, state.position) {
                (Signal::Buy, None) => state.open(bar),
                (Signal::TakeProfit, Some(position)) => state.close(position, bar),
                _ => {}
            }

            state.mark(bar);
        }

        // An open position is marked to market at the last close, not sold
        let final_capital = series
            .last()
            .map(|bar| state.value_at(bar.close))
            .unwrap_or(state.capital);

        let (closed_pairs, profitable_trades) = pair_stats(&state.trades);
        let win_rate_pct = if closed_pairs > 0 {
            profitable_trades as f64 / closed_pairs as f64 * 100.0
        } else {
            0.0
        };

        let report = Report {
            initial_capital: config.initial_capital,
            final_capital,
            total_return_pct: (final_capital - config.initial_capital) / config.initial_capital
                * 100.0,
            max_drawdown_pct: state.max_drawdown * 100.0,
            total_trades: state.trades.len(),
            profitable_trades,
            win_rate_pct,
        };

        info!(
            total_trades = report.total_trades,
            profitable_trades,
            win_rate = report.win_rate_pct,
            total_return = report.total_return_pct,
            max_drawdown = report.max_drawdown_pct,
            open_at_end = state.position.is_some(),
            "Backtest complete"
        );

        Ok(BacktestResult {
            config: config.clone(),
            report,
            trades: state.trades,
            equity_curve: state.equity_curve,
            start_time: series.bars().first().map(|b| b.timestamp).unwrap_or(0),
            end_time: series.last().map(|b| b.timestamp).unwrap_or(0),
            bars: series.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const DAY: i64 = 86_400;

    fn make_series(closes: &[f64]) -> PriceSeries {
        PriceSeries::from_closes(closes, 1_600_000_000, DAY).unwrap()
    }

    fn small_config(smoothing: RsiSmoothing) -> BacktestConfig {
        BacktestConfig {
            strategy: StrategyConfig {
                rsi_period: 3,
                sma_period: 5,
                rsi_smoothing: smoothing,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn dip_and_recovery() -> Vec<f64> {
        let mut closes = vec![100.0; 200];
        closes.extend([60.0, 73.0, 72.5, 72.0, 71.5, 71.0, 90.0, 100.0, 110.0]);
        closes.extend([110.0; 7]);
        closes
    }

    fn random_walk(seed: u64, len: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price = 1_000.0;
        (0..len)
            .map(|_| {
                price *= 1.0 + rng.gen_range(-0.05..0.05);
                price
            })
            .collect()
    }

    #[test]
    fn test_empty_series() {
        let config = BacktestConfig::default();
        let result = BacktestEngine::run(&config, &PriceSeries::default()).unwrap();
        assert_eq!(result.report.total_trades, 0);
        assert_eq!(result.report.final_capital, config.initial_capital);
        assert_eq!(result.start_time, 0);
        assert!(result.equity_curve.is_empty());
    }

    #[test]
    fn test_short_series_never_trades() {
        for smoothing in [RsiSmoothing::Continuous, RsiSmoothing::Windowed] {
            let config = small_config(smoothing);
            // 7 bars < sma_period + rsi_period: every evaluation is a hold
            let series = make_series(&[100.0, 90.0, 95.0, 80.0, 99.0, 70.0, 101.0]);
            let result = BacktestEngine::run(&config, &series).unwrap();

            assert!(result.trades.is_empty());
            assert_eq!(result.report.final_capital, config.initial_capital);
            assert_eq!(result.report.max_drawdown_pct, 0.0);
            assert_eq!(result.report.win_rate_pct, 0.0);
        }
    }

    #[test]
    fn test_dip_and_recovery_makes_one_profitable_round_trip() {
        for smoothing in [RsiSmoothing::Continuous, RsiSmoothing::Windowed] {
            let config = small_config(smoothing);
            let series = make_series(&dip_and_recovery());
            let result = BacktestEngine::run(&config, &series).unwrap();

            assert_eq!(result.trades.len(), 2, "{smoothing}");
            let (buy, sell) = (&result.trades[0], &result.trades[1]);
            assert_eq!(buy.kind, TradeKind::Buy);
            assert_eq!(buy.price, 71.0);
            assert_eq!(buy.timestamp, series.bars()[205].timestamp);
            assert_eq!(buy.capital_after, 10_000.0);
            assert_eq!(sell.kind, TradeKind::Sell);
            assert_eq!(sell.price, 90.0);
            assert_eq!(sell.position_id, buy.position_id);

            let expected = 10_000.0 / 71.0 * 90.0;
            assert!((result.report.final_capital - expected).abs() < 1e-6);
            assert!(result.report.final_capital > result.report.initial_capital);
            assert_eq!(result.report.profitable_trades, 1);
            assert_eq!(result.report.win_rate_pct, 100.0);
            assert_eq!(result.report.max_drawdown_pct, 0.0);
        }
    }

    #[test]
    fn test_open_position_is_marked_to_market() {
        let mut closes = dip_and_recovery()[..=205].to_vec();
        closes.extend([70.0, 69.0]);
        let config = small_config(RsiSmoothing::Continuous);
        let result = BacktestEngine::run(&config, &make_series(&closes)).unwrap();

        assert_eq!(result.trades.len(), 1);
        let expected = 10_000.0 / 71.0 * 69.0;
        assert!((result.report.final_capital - expected).abs() < 1e-6);
        assert!(result.report.total_return_pct < 0.0);
        // No closed pair yet
        assert_eq!(result.report.win_rate_pct, 0.0);
        let drawdown = (10_000.0 - expected) / 10_000.0 * 100.0;
        assert!((result.report.max_drawdown_pct - drawdown).abs() < 1e-9);
    }

    #[test]
    fn test_monotonic_rise_never_trades() {
        let closes: Vec<f64> = (0..300).map(|i| 100.0 + i as f64).collect();
        for smoothing in [RsiSmoothing::Continuous, RsiSmoothing::Windowed] {
            let result =
                BacktestEngine::run(&small_config(smoothing), &make_series(&closes)).unwrap();
            assert!(result.trades.is_empty());
            assert_eq!(result.report.final_capital, 10_000.0);
        }
    }

    #[test]
    fn test_ledger_alternates_and_capital_moves_only_on_sells() {
        for seed in 0..20 {
            let series = make_series(&random_walk(seed, 400));
            for smoothing in [RsiSmoothing::Continuous, RsiSmoothing::Windowed] {
                let result = BacktestEngine::run(&small_config(smoothing), &series).unwrap();

                let mut capital = result.report.initial_capital;
                for (n, trade) in result.trades.iter().enumerate() {
                    let expected_kind = if n % 2 == 0 { TradeKind::Buy } else { TradeKind::Sell };
                    assert_eq!(trade.kind, expected_kind, "seed {seed} trade {n}");
                    match trade.kind {
                        TradeKind::Buy => assert_eq!(trade.capital_after, capital),
                        TradeKind::Sell => {
                            let entry = &result.trades[n - 1];
                            assert_eq!(trade.position_id, entry.position_id);
                            assert_eq!(trade.position_size, entry.position_size);
                            capital = trade.capital_after;
                        }
                    }
                }

                let r = &result.report;
                assert!(r.profitable_trades <= r.total_trades / 2);
                assert!((0.0..=100.0).contains(&r.max_drawdown_pct));
                assert_eq!(result.equity_curve.len(), series.len() - 5);
            }
        }
    }

    #[test]
    fn test_backtest_is_idempotent() {
        let series = make_series(&random_walk(1234, 500));
        let config = small_config(RsiSmoothing::Continuous);
        let first = BacktestEngine::run(&config, &series).unwrap();
        let second = BacktestEngine::run(&config, &series).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_macd_confirmation_delays_both_legs() {
        // Crash, a slow grind higher, a sharp rally that then fades
        let mut closes = vec![100.0; 60];
        closes.push(60.0);
        for _ in 0..30 {
            let last = *closes.last().unwrap();
            closes.push(last + 0.25);
        }
        for _ in 0..10 {
            let last = *closes.last().unwrap();
            closes.push(last + 3.0);
        }
        for _ in 0..20 {
            let last = *closes.last().unwrap();
            closes.push(last + 0.25);
        }
        let series = make_series(&closes);

        let mut config = BacktestConfig {
            strategy: StrategyConfig {
                rsi_period: 14,
                sma_period: 10,
                ..Default::default()
            },
            ..Default::default()
        };

        let trend_only = BacktestEngine::run(&config, &series).unwrap();
        assert_eq!(trend_only.trades[0].timestamp, series.bars()[70].timestamp);

        config.signal_mode = SignalMode::TrendWithMacd;
        let confirmed = BacktestEngine::run(&config, &series).unwrap();
        assert_eq!(confirmed.trades.len(), 2);
        assert_eq!(confirmed.trades[0].price, 63.25);
        assert_eq!(confirmed.trades[1].price, 100.25);
        assert_eq!(confirmed.report.profitable_trades, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = BacktestConfig {
            initial_capital: -1.0,
            ..Default::default()
        };
        let err = BacktestEngine::run(&config, &make_series(&[1.0, 2.0])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_pair_stats_links_by_position_id() {
        let trade = |position_id, kind, price| Trade {
            position_id,
            kind,
            price,
            timestamp: 0,
            position_size: 1.0,
            capital_after: 0.0,
        };
        // Out-of-order ledger still pairs correctly through the explicit link
        let trades = vec![
            trade(1, TradeKind::Buy, 10.0),
            trade(2, TradeKind::Buy, 20.0),
            trade(2, TradeKind::Sell, 15.0),
            trade(1, TradeKind::Sell, 12.0),
        ];
        assert_eq!(pair_stats(&trades), (2, 1));
    }
}
