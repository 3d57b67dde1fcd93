//! Market data sources

pub mod kraken;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Interval, PriceSeries};

pub use kraken::KrakenClient;

/// Anything that can supply a close-price history for a pair
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn price_series(&self, pair: &str, interval: Interval) -> Result<PriceSeries>;
}
