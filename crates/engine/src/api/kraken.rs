//! Kraken public API client for OHLC data (no authentication required)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, warn};

use super::MarketData;
use crate::types::{Interval, Ohlc, PriceBar, PriceSeries};

pub const DEFAULT_BASE_URL: &str = "https://api.kraken.com/0/public";

/// Kraken public market data client
#[derive(Clone)]
pub struct KrakenClient {
    client: Client,
    base_url: String,
}

/// Kraken wraps every response in `{"error": [...], "result": {...}}`
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: Vec<String>,
    result: Option<Value>,
}

/// Raw OHLC row: [time, open, high, low, close, vwap, volume, count]
#[derive(Debug, Deserialize)]
struct RawOhlc(i64, String, String, String, String, String, String, u64);

impl RawOhlc {
    fn into_ohlc(self) -> Option<Ohlc> {
        Some(Ohlc {
            time: self.0,
            open: Decimal::from_str(&self.1).ok()?,
            high: Decimal::from_str(&self.2).ok()?,
            low: Decimal::from_str(&self.3).ok()?,
            close: Decimal::from_str(&self.4).ok()?,
            vwap: Decimal::from_str(&self.5).ok()?,
            volume: Decimal::from_str(&self.6).ok()?,
            count: self.7,
        })
    }
}

impl Default for KrakenClient {
    fn default() -> Self {
        Self::new()
    }
}

impl KrakenClient {
    /// Create a new Kraken client with the default base URL
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch OHLC bars for a pair. Kraken returns at most 720 bars per call.
    pub async fn get_ohlc(
        &self,
        pair: &str,
        interval: Interval,
        since: Option<i64>,
    ) -> Result<Vec<Ohlc>> {
        let mut url = format!(
            "{}/OHLC?pair={}&interval={}",
            self.base_url,
            pair,
            interval.minutes()
        );
        if let Some(since) = since {
            url.push_str(&format!("&since={}", since));
        }

        debug!(pair, %interval, "Fetching OHLC from Kraken");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Kraken API error {}: {}", status, body);
        }

        let body = response.text().await?;
        let bars = parse_ohlc_response(&body)?;

        debug!(count = bars.len(), "Fetched OHLC bars");
        Ok(bars)
    }
}

/// Parse an `/OHLC` response body. The result object carries one array keyed by
/// the exchange's canonical pair name next to a `last` cursor.
fn parse_ohlc_response(body: &str) -> Result<Vec<Ohlc>> {
    let envelope: Envelope =
        serde_json::from_str(body).context("Malformed Kraken response")?;

    if !envelope.error.is_empty() {
        anyhow::bail!("Kraken returned errors: {}", envelope.error.join(", "));
    }

    let result = envelope
        .result
        .context("Kraken response has no result")?;
    let rows = result
        .as_object()
        .and_then(|obj| obj.values().find(|v| v.is_array()))
        .cloned()
        .context("Kraken result has no OHLC array")?;

    let raw: Vec<RawOhlc> = serde_json::from_value(rows).context("Malformed OHLC rows")?;
    let total = raw.len();
    let bars: Vec<Ohlc> = raw.into_iter().filter_map(RawOhlc::into_ohlc).collect();

    if bars.len() < total {
        warn!(skipped = total - bars.len(), "Skipped OHLC rows with unparsable prices");
    }
    Ok(bars)
}

/// Reduce exchange bars to a validated close-price series
pub fn to_price_series(bars: &[Ohlc]) -> Result<PriceSeries> {
    let bars: Vec<PriceBar> = bars.iter().filter_map(Ohlc::to_price_bar).collect();
    Ok(PriceSeries::new(bars)?)
}

#[async_trait]
impl MarketData for KrakenClient {
    async fn price_series(&self, pair: &str, interval: Interval) -> Result<PriceSeries> {
        let bars = self.get_ohlc(pair, interval, None).await?;
        to_price_series(&bars)
    }
}
