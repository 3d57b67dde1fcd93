//! Live signal orchestrator: poll market data, confirm the trend signal with
//! the MACD rule, and record each new action so it is only taken once.
//!
//! The last action lives in a one-line text file (`"<ACTION> at <price>"`),
//! which keeps state across restarts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::api::MarketData;
use crate::error::{EngineError, EngineResult};
use crate::strategy::{
    confirm, latest_trend_signal, macd_crossover, MacdDecision, Signal, MACD_MIN_BARS, MACD_WINDOW,
};
use crate::types::{Interval, PriceBar, StrategyConfig};

/// Longest single sleep before re-checking for cancellation
const SLEEP_SLICE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A signal the orchestrator acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    TakeProfit,
}

impl Action {
    pub fn from_signal(signal: Signal) -> Option<Self> {
        match signal {
            Signal::Buy => Some(Action::Buy),
            Signal::TakeProfit => Some(Action::TakeProfit),
            Signal::Hold => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

impl FromStr for Action {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "BUY" => Ok(Action::Buy),
            // Older files spell it with a space
            "TAKE_PROFIT" | "TAKE PROFIT" => Ok(Action::TakeProfit),
            other => Err(EngineError::UnknownAction(other.to_string())),
        }
    }
}

/// The most recent action and the close it was taken at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastAction {
    pub action: Action,
    pub price: f64,
}

impl fmt::Display for LastAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.action, self.price)
    }
}

impl FromStr for LastAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, price) = s
            .trim()
            .split_once(" at ")
            .ok_or_else(|| EngineError::UnknownAction(s.trim().to_string()))?;
        let price = price
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::UnknownAction(s.trim().to_string()))?;
        Ok(LastAction {
            action: action.parse()?,
            price,
        })
    }
}

/// File-backed store for the last action taken
#[derive(Debug, Clone)]
pub struct ActionStore {
    path: PathBuf,
}

impl ActionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means nothing has been done yet. So does a file we
    /// cannot make sense of, which is logged and then overwritten on the next action.
    pub async fn read(&self) -> Result<Option<LastAction>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let line = contents.trim();
        if line.is_empty() {
            return Ok(None);
        }
        match line.parse() {
            Ok(last) => Ok(Some(last)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable action file");
                Ok(None)
            }
        }
    }

    pub async fn write(&self, last: &LastAction) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, last.to_string())
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub pair: String,
    pub trend_interval: Interval,
    pub macd_interval: Interval,
    pub macd_window: usize,
    pub poll_interval_secs: u64,
    pub action_file: PathBuf,
    pub strategy: StrategyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pair: "XXBTZUSD".to_string(),
            trend_interval: Interval::FIVE_MINUTES,
            macd_interval: Interval::FOUR_HOURS,
            macd_window: MACD_WINDOW,
            poll_interval_secs: 600,
            action_file: PathBuf::from("previous_action.txt"),
            strategy: StrategyConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> EngineResult<()> {
        self.strategy.validate()?;
        if self.pair.trim().is_empty() {
            return Err(EngineError::InvalidConfig("pair must not be empty".into()));
        }
        if self.macd_window < MACD_MIN_BARS {
            return Err(EngineError::InvalidConfig(format!(
                "macd_window must be at least {MACD_MIN_BARS}"
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "poll_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Both rules evaluated on the latest data
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalSnapshot {
    pub trend: Signal,
    pub macd: MacdDecision,
    pub combined: Signal,
    pub price: f64,
    pub timestamp: i64,
}

/// What one polling cycle decided
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Hold { price: f64 },
    Unconfirmed { trend: Signal, macd: MacdDecision, price: f64 },
    Duplicate { action: Action, price: f64 },
    Acted { action: Action, price: f64 },
}

pub struct LiveOrchestrator<M> {
    market: M,
    config: OrchestratorConfig,
    store: ActionStore,
}

impl<M: MarketData> LiveOrchestrator<M> {
    pub fn new(market: M, config: OrchestratorConfig) -> EngineResult<Self> {
        config.validate()?;
        let store = ActionStore::new(&config.action_file);
        Ok(Self {
            market,
            config,
            store,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &ActionStore {
        &self.store
    }

    async fn trend(&self) -> Result<(Signal, PriceBar)> {
        let series = self
            .market
            .price_series(&self.config.pair, self.config.trend_interval)
            .await?;
        let last = *series.last().with_context(|| {
            format!(
                "No {} bars for {}",
                self.config.trend_interval, self.config.pair
            )
        })?;
        let signal = latest_trend_signal(&series.closes(), &self.config.strategy)?;
        Ok((signal, last))
    }

    async fn macd(&self) -> Result<MacdDecision> {
        let series = self
            .market
            .price_series(&self.config.pair, self.config.macd_interval)
            .await?;
        let window = series.tail(self.config.macd_window).closes();
        Ok(macd_crossover(&window))
    }

    /// Evaluate both rules without touching the action file
    pub async fn snapshot(&self) -> Result<SignalSnapshot> {
        let (trend, bar) = self.trend().await?;
        let macd = self.macd().await?;
        Ok(SignalSnapshot {
            trend,
            macd,
            combined: confirm(trend, macd),
            price: bar.close,
            timestamp: bar.timestamp,
        })
    }

    /// One polling cycle. The MACD series is only fetched when the trend rule
    /// has something to confirm.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let (trend, bar) = self.trend().await?;
        let price = bar.close;

        let Some(action) = Action::from_signal(trend) else {
            info!(pair = %self.config.pair, price, "Trend signal HOLD");
            return Ok(CycleOutcome::Hold { price });
        };

        let macd = self.macd().await?;
        if macd != MacdDecision::Signal(trend) {
            info!(pair = %self.config.pair, %trend, %macd, price, "Signal not confirmed by MACD");
            return Ok(CycleOutcome::Unconfirmed { trend, macd, price });
        }

        if let Some(previous) = self.store.read().await? {
            if previous.action == action {
                info!(%action, previous = %previous, "Action already taken");
                return Ok(CycleOutcome::Duplicate { action, price });
            }
        }

        let last = LastAction { action, price };
        self.store.write(&last).await?;
        info!(pair = %self.config.pair, %action, price, "Signal confirmed, action recorded");
        Ok(CycleOutcome::Acted { action, price })
    }
}

// ---------------------------------------------------------------------------
// Polling loop
// ---------------------------------------------------------------------------

/// Time source for the polling loop
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiveStatus {
    Idle,
    Running,
    Error,
}

/// Shared progress for the live loop (same pattern as the other background tasks)
pub struct LiveProgress {
    pub status: RwLock<LiveStatus>,
    pub cancelled: AtomicBool,
    pub cycles: AtomicU64,
    pub last_outcome: RwLock<Option<CycleOutcome>>,
    pub last_cycle_at: RwLock<Option<DateTime<Utc>>>,
    pub error_message: RwLock<Option<String>>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(LiveStatus::Idle),
            cancelled: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            last_outcome: RwLock::new(None),
            last_cycle_at: RwLock::new(None),
            error_message: RwLock::new(None),
        }
    }

    pub fn reset(&self) {
        *self.status.write().unwrap() = LiveStatus::Running;
        self.cancelled.store(false, Ordering::Relaxed);
        self.cycles.store(0, Ordering::Relaxed);
        *self.last_outcome.write().unwrap() = None;
        *self.last_cycle_at.write().unwrap() = None;
        *self.error_message.write().unwrap() = None;
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), LiveStatus::Running)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

impl Default for LiveProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll until cancelled, or until `max_cycles` cycles have run.
///
/// A failed cycle is logged and recorded in `progress`; the loop carries on
/// with the next one. The loop ends `Error` if its last cycle failed, `Idle`
/// otherwise.
pub async fn run_live<M: MarketData, C: Clock>(
    orchestrator: &LiveOrchestrator<M>,
    clock: &C,
    progress: &LiveProgress,
    max_cycles: Option<u64>,
) {
    let poll = Duration::from_secs(orchestrator.config().poll_interval_secs);
    info!(
        pair = %orchestrator.config().pair,
        poll_secs = poll.as_secs(),
        action_file = %orchestrator.store().path().display(),
        "Live orchestrator starting"
    );
    *progress.status.write().unwrap() = LiveStatus::Running;

    while !progress.is_cancelled() {
        match orchestrator.run_cycle().await {
            Ok(outcome) => {
                *progress.last_outcome.write().unwrap() = Some(outcome);
                *progress.error_message.write().unwrap() = None;
            }
            Err(e) => {
                error!(error = %e, "Live cycle failed");
                *progress.error_message.write().unwrap() = Some(e.to_string());
            }
        }
        *progress.last_cycle_at.write().unwrap() = Some(clock.now());
        let cycles = progress.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        if max_cycles.is_some_and(|max| cycles >= max) {
            break;
        }

        let mut remaining = poll;
        while !remaining.is_zero() && !progress.is_cancelled() {
            let slice = remaining.min(SLEEP_SLICE);
            clock.sleep(slice).await;
            remaining -= slice;
        }
    }

    if progress.is_cancelled() {
        info!("Live orchestrator cancelled");
    }
    info!(cycles = progress.cycles(), "Live orchestrator stopped");

    // A loop whose last cycle failed stops in Error so status pollers see it
    let last_failed = progress.error_message.read().unwrap().is_some();
    *progress.status.write().unwrap() = if last_failed {
        LiveStatus::Error
    } else {
        LiveStatus::Idle
    };
}
