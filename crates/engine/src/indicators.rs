//! Indicator math: SMA, Wilder RSI, EMA and MACD
//!
//! Two forms are provided. The free functions compute an indicator over a
//! whole window in one call. The structs carry their smoothing state and are
//! advanced one close at a time through `ta::Next`, so a simulator pays O(1)
//! per bar instead of re-deriving the seed from a trailing window.
//!
//! Passing a window shorter than an indicator needs is a caller bug, and the
//! batch functions panic on it.

use std::collections::VecDeque;
use ta::{Next, Period, Reset};

use crate::error::{EngineError, EngineResult};

pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

// ============================================================================
// Batch functions
// ============================================================================

/// Arithmetic mean of the last `period` values of `window`.
pub fn sma(window: &[f64], period: usize) -> f64 {
    assert!(
        period > 0 && window.len() >= period,
        "sma: window of {} values is shorter than period {}",
        window.len(),
        period
    );
    mean(&window[window.len() - period..])
}

/// Mean taken as offsets from the first value, so a constant run of values
/// averages to exactly that value.
fn mean(values: &[f64]) -> f64 {
    let base = values[0];
    base + values.iter().map(|v| v - base).sum::<f64>() / values.len() as f64
}

/// Wilder RSI over every delta in `window`.
///
/// The averages are seeded with the mean of the first `period` gains/losses
/// and smoothed over the remaining deltas, so the result depends on where the
/// window starts.
pub fn rsi(window: &[f64], period: usize) -> f64 {
    assert!(
        period > 0 && window.len() > period,
        "rsi: window of {} closes gives fewer than {} deltas",
        window.len(),
        period
    );

    let (gains, losses): (Vec<f64>, Vec<f64>) = window
        .windows(2)
        .map(|w| split_delta(w[1] - w[0]))
        .unzip();

    let n = period as f64;
    let mut avg_gain = gains[..period].iter().sum::<f64>() / n;
    let mut avg_loss = losses[..period].iter().sum::<f64>() / n;

    for (gain, loss) in gains[period..].iter().zip(&losses[period..]) {
        avg_gain = wilder_step(avg_gain, *gain, period);
        avg_loss = wilder_step(avg_loss, *loss, period);
    }

    rsi_from_averages(avg_gain, avg_loss)
}

/// EMA seeded with the SMA of the first `period` values.
/// Empty when the series is shorter than `period`; otherwise `len - period + 1` long.
pub fn ema(series: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || series.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = series[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(series.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &value in &series[period..] {
        prev = (value - prev) * k + prev;
        out.push(prev);
    }
    out
}

/// MACD line and its signal line, both ending on the last close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacdLines {
    /// `ema12 - ema26`, `n - 25` points
    pub macd: Vec<f64>,
    /// `ema9` of the MACD line, `n - 33` points (empty below 9 MACD points)
    pub signal: Vec<f64>,
}

pub fn macd(closes: &[f64]) -> MacdLines {
    let fast = ema(closes, MACD_FAST);
    let slow = ema(closes, MACD_SLOW);
    if slow.is_empty() {
        return MacdLines::default();
    }

    // Both EMAs end on the last close; the fast one starts SLOW - FAST bars earlier
    let offset = fast.len() - slow.len();
    let line: Vec<f64> = fast[offset..]
        .iter()
        .zip(&slow)
        .map(|(f, s)| f - s)
        .collect();

    let signal = if line.len() >= MACD_SIGNAL {
        ema(&line, MACD_SIGNAL)
    } else {
        Vec::new()
    };

    MacdLines { macd: line, signal }
}

fn split_delta(delta: f64) -> (f64, f64) {
    let gain = if delta > 0.0 { delta } else { 0.0 };
    let loss = if delta < 0.0 { -delta } else { 0.0 };
    (gain, loss)
}

fn wilder_step(avg: f64, value: f64, period: usize) -> f64 {
    (avg * (period as f64 - 1.0) + value) / period as f64
}

/// No losses means an infinite RS, which pins RSI at 100.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

fn check_period(name: &str, period: usize) -> EngineResult<()> {
    if period == 0 {
        return Err(EngineError::InvalidConfig(format!(
            "{name} period must be positive"
        )));
    }
    Ok(())
}

// ============================================================================
// Incremental indicators
// ============================================================================

/// Simple moving average over the last `period` inputs.
///
/// Keeps the window itself rather than a running sum, so its output is
/// bit-identical to `sma` over the same closes however long the history.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
}

impl Sma {
    pub fn new(period: usize) -> EngineResult<Self> {
        check_period("SMA", period)?;
        Ok(Self {
            period,
            window: VecDeque::with_capacity(period),
        })
    }
}

impl Next<f64> for Sma {
    type Output = Option<f64>;

    fn next(&mut self, value: f64) -> Option<f64> {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(value);
        (self.window.len() == self.period).then(|| mean(self.window.make_contiguous()))
    }
}

impl Reset for Sma {
    fn reset(&mut self) {
        self.window.clear();
    }
}

impl Period for Sma {
    fn period(&self) -> usize {
        self.period
    }
}

/// Wilder RSI carried bar by bar.
///
/// Yields `None` until `period` deltas have been seen. Fed exactly the closes
/// of a window, its last output equals `rsi(window, period)`.
#[derive(Debug, Clone)]
pub struct WilderRsi {
    period: usize,
    prev_close: Option<f64>,
    deltas_seen: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl WilderRsi {
    pub fn new(period: usize) -> EngineResult<Self> {
        check_period("RSI", period)?;
        Ok(Self {
            period,
            prev_close: None,
            deltas_seen: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.deltas_seen >= self.period
    }

    /// Current RSI, once seeded
    pub fn value(&self) -> Option<f64> {
        self.is_ready()
            .then(|| rsi_from_averages(self.avg_gain, self.avg_loss))
    }

    pub fn avg_gain(&self) -> f64 {
        self.avg_gain
    }

    pub fn avg_loss(&self) -> f64 {
        self.avg_loss
    }
}

impl Next<f64> for WilderRsi {
    type Output = Option<f64>;

    fn next(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev_close.replace(close)?;
        let (gain, loss) = split_delta(close - prev);
        self.deltas_seen += 1;

        if self.deltas_seen <= self.period {
            // Accumulate sums while seeding, divide once the seed window is full
            self.avg_gain += gain;
            self.avg_loss += loss;
            if self.deltas_seen == self.period {
                self.avg_gain /= self.period as f64;
                self.avg_loss /= self.period as f64;
            }
        } else {
            self.avg_gain = wilder_step(self.avg_gain, gain, self.period);
            self.avg_loss = wilder_step(self.avg_loss, loss, self.period);
        }

        self.value()
    }
}

impl Reset for WilderRsi {
    fn reset(&mut self) {
        self.prev_close = None;
        self.deltas_seen = 0;
        self.avg_gain = 0.0;
        self.avg_loss = 0.0;
    }
}

impl Period for WilderRsi {
    fn period(&self) -> usize {
        self.period
    }
}

/// EMA seeded with the SMA of its first `period` inputs.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    seed_sum: f64,
    count: usize,
    current: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> EngineResult<Self> {
        check_period("EMA", period)?;
        Ok(Self {
            period,
            k: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            count: 0,
            current: None,
        })
    }

    pub fn value(&self) -> Option<f64> {
        self.current
    }
}

impl Next<f64> for Ema {
    type Output = Option<f64>;

    fn next(&mut self, value: f64) -> Option<f64> {
        self.current = match self.current {
            Some(prev) => Some((value - prev) * self.k + prev),
            None => {
                self.seed_sum += value;
                self.count += 1;
                (self.count == self.period).then(|| self.seed_sum / self.period as f64)
            }
        };
        self.current
    }
}

impl Reset for Ema {
    fn reset(&mut self) {
        self.seed_sum = 0.0;
        self.count = 0;
        self.current = None;
    }
}

impl Period for Ema {
    fn period(&self) -> usize {
        self.period
    }
}

/// One MACD observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    /// `None` until 9 MACD points have been seen
    pub signal: Option<f64>,
}

/// MACD (12, 26, 9) carried bar by bar.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> EngineResult<Self> {
        if fast >= slow {
            return Err(EngineError::InvalidConfig(format!(
                "MACD fast period {fast} must be shorter than slow period {slow}"
            )));
        }
        Ok(Self {
            fast: Ema::new(fast)?,
            slow: Ema::new(slow)?,
            signal: Ema::new(signal)?,
        })
    }

    pub fn standard() -> Self {
        Self {
            fast: Ema::new(MACD_FAST).expect("MACD_FAST is positive"),
            slow: Ema::new(MACD_SLOW).expect("MACD_SLOW is positive"),
            signal: Ema::new(MACD_SIGNAL).expect("MACD_SIGNAL is positive"),
        }
    }
}

impl Next<f64> for Macd {
    type Output = Option<MacdPoint>;

    fn next(&mut self, close: f64) -> Option<MacdPoint> {
        let fast = self.fast.next(close);
        let slow = self.slow.next(close)?;
        // The fast EMA is always seeded by the time the slow one is
        let macd = fast? - slow;
        Some(MacdPoint {
            macd,
            signal: self.signal.next(macd),
        })
    }
}

impl Reset for Macd {
    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }
}

impl Period for Macd {
    fn period(&self) -> usize {
        self.slow.period()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_walk(seed: u64, len: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut price = 100.0;
        (0..len)
            .map(|_| {
                price *= 1.0 + rng.gen_range(-0.03..0.03);
                price
            })
            .collect()
    }

    #[test]
    fn test_sma_of_constant_window_is_the_constant() {
        for len in 5..12 {
            assert_eq!(sma(&vec![42.5; len], 5), 42.5);
        }
    }

    #[test]
    fn test_sma_of_inexact_constants_is_exact() {
        for value in [1234.567, 0.1, 37_050.2, 99.99, 1e-3] {
            for period in [3, 5, 10, 200] {
                assert_eq!(sma(&vec![value; period], period), value, "{value} x {period}");
            }
        }
    }

    #[test]
    fn test_streamed_sma_matches_batch_and_settles_on_flat_prices() {
        let mut closes = random_walk(11, 3_000);
        closes.extend([1234.567; 50]);

        let mut streamed = Sma::new(10).unwrap();
        for (i, &close) in closes.iter().enumerate() {
            let value = streamed.next(close);
            if i + 1 < 10 {
                assert_eq!(value, None);
            } else {
                assert_eq!(value, Some(sma(&closes[..=i], 10)));
            }
        }
        assert_eq!(streamed.next(1234.567), Some(1234.567));

        streamed.reset();
        assert_eq!(streamed.next(1.0), None);
        assert!(Sma::new(0).is_err());
    }

    #[test]
    fn test_sma_uses_trailing_values() {
        assert_eq!(sma(&[100.0, 1.0, 2.0, 3.0], 3), 2.0);
    }

    #[test]
    #[should_panic(expected = "shorter than period")]
    fn test_sma_short_window_panics() {
        sma(&[1.0, 2.0], 3);
    }

    #[test]
    #[should_panic(expected = "fewer than")]
    fn test_rsi_short_window_panics() {
        rsi(&[1.0, 2.0, 3.0], 3);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        assert_eq!(rsi(&[1.0, 2.0, 3.0, 3.0, 7.0], 3), 100.0);
        // A flat window has no losses either
        assert_eq!(rsi(&[5.0; 6], 3), 100.0);
    }

    #[test]
    fn test_rsi_all_losses_is_0() {
        assert_eq!(rsi(&[10.0, 9.0, 9.0, 7.0, 6.5], 3), 0.0);
    }

    #[test]
    fn test_rsi_known_value() {
        // deltas +1, -1, +1: seed 0.5/0.5, then gain 0.75, loss 0.25 -> RS 3
        assert_eq!(rsi(&[1.0, 2.0, 1.0, 2.0], 2), 75.0);
    }

    #[test]
    fn test_ema_length_and_values() {
        assert_eq!(ema(&[1.0, 2.0, 3.0, 4.0, 5.0], 3), vec![2.0, 3.0, 4.0]);
        assert!(ema(&[1.0, 2.0], 3).is_empty());

        let series = random_walk(7, 50);
        for period in 1..=50 {
            assert_eq!(ema(&series, period).len(), series.len() - period + 1);
        }
    }

    #[test]
    fn test_macd_alignment_on_linear_fixture() {
        // A straight line seeds every EMA at its steady state: ema12 lags by 5.5,
        // ema26 by 12.5, so every MACD point is exactly 7 apart in exact arithmetic.
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let lines = macd(&closes);

        assert_eq!(lines.macd.len(), 40 - 25);
        assert_eq!(lines.signal.len(), 40 - 33);
        for v in lines.macd.iter().chain(&lines.signal) {
            assert!((v - 7.0).abs() < 1e-9, "got {v}");
        }

        let e12 = ema(&closes, 12);
        let e26 = ema(&closes, 26);
        assert_eq!(lines.macd[0], e12[14] - e26[0]);
        assert_eq!(*lines.macd.last().unwrap(), e12.last().unwrap() - e26.last().unwrap());
    }

    #[test]
    fn test_macd_short_inputs() {
        assert_eq!(macd(&[1.0; 25]), MacdLines::default());

        let lines = macd(&[1.0; 33]);
        assert_eq!(lines.macd.len(), 8);
        assert!(lines.signal.is_empty());

        assert_eq!(macd(&[1.0; 34]).signal.len(), 1);
    }

    #[test]
    fn test_incremental_rsi_matches_batch() {
        let closes = random_walk(42, 120);
        let period = 10;
        let mut live = WilderRsi::new(period).unwrap();

        for (i, &close) in closes.iter().enumerate() {
            let out = live.next(close);
            if i < period {
                assert!(out.is_none());
            } else {
                let batch = rsi(&closes[..=i], period);
                assert!((out.unwrap() - batch).abs() < 1e-9, "bar {i}");
            }
        }
    }

    #[test]
    fn test_incremental_ema_matches_batch() {
        let closes = random_walk(3, 60);
        let mut live = Ema::new(9).unwrap();
        let streamed: Vec<f64> = closes.iter().filter_map(|&c| live.next(c)).collect();
        assert_eq!(streamed, ema(&closes, 9));
    }

    #[test]
    fn test_incremental_macd_matches_batch_tail() {
        let closes = random_walk(11, 80);
        let mut live = Macd::standard();
        let points: Vec<MacdPoint> = closes.iter().filter_map(|&c| live.next(c)).collect();
        let batch = macd(&closes);

        assert_eq!(points.len(), batch.macd.len());
        let signals: Vec<f64> = points.iter().filter_map(|p| p.signal).collect();
        assert_eq!(signals.len(), batch.signal.len());

        let last = points.last().unwrap();
        assert!((last.macd - batch.macd.last().unwrap()).abs() < 1e-9);
        assert!((last.signal.unwrap() - batch.signal.last().unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_reset_and_period() {
        let mut live = WilderRsi::new(3).unwrap();
        for c in [1.0, 2.0, 3.0, 4.0] {
            live.next(c);
        }
        assert!(live.is_ready());
        live.reset();
        assert!(!live.is_ready());
        assert_eq!(live.next(1.0), None);
        assert_eq!(live.period(), 3);

        let mut m = Macd::standard();
        assert_eq!(m.period(), MACD_SLOW);
        for c in random_walk(1, 30) {
            m.next(c);
        }
        m.reset();
        assert_eq!(m.next(1.0), None);
    }

    #[test]
    fn test_zero_periods_rejected() {
        assert!(WilderRsi::new(0).is_err());
        assert!(Ema::new(0).is_err());
        assert!(Macd::new(26, 12, 9).is_err());
    }
}
