//! Market data abstractions and core types

use crate::core::fund::FundCode;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Live, unofficial percentage change published during trading hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Estimation {
    pub pct: f64,
    pub as_of: Option<NaiveDateTime>,
    pub name: Option<String>,
}

/// Confirmed end-of-day percentage change, available after market close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfficialChange {
    pub date: NaiveDate,
    pub nav: Option<f64>,
    pub pct: f64,
}

/// Where the percentage applied by a settlement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PctSource {
    Official,
    Estimate,
}

/// Source of valuation data for a single fund.
///
/// Implementations apply their own bounded timeout and return `None` instead
/// of an error on network or payload failures.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_estimation(&self, code: &FundCode) -> Option<Estimation>;

    async fn fetch_official_change(&self, code: &FundCode) -> Option<OfficialChange>;
}

/// Picks the percentage to settle with: the official change when it is dated
/// `today`, otherwise the live estimate.
pub fn select_pct(
    official: Option<&OfficialChange>,
    estimate: Option<&Estimation>,
    today: NaiveDate,
) -> Option<(f64, PctSource)> {
    if let Some(change) = official.filter(|c| c.date == today) {
        return Some((change.pct, PctSource::Official));
    }
    estimate.map(|e| (e.pct, PctSource::Estimate))
}
