//! Position ledger and daily snapshot records, plus the storage contract
//! shared by every ledger backend.

use crate::core::fund::{FundCode, FundId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type UserId = u64;

/// Most recent records returned by an undated snapshot listing.
pub const RECENT_SNAPSHOT_LIMIT: usize = 500;

/// One user's holding in one fund. Unique per `(user, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: FundId,
    #[serde(default)]
    pub fund_name: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    /// Profit computed by the latest settlement slot, not a running sum.
    #[serde(default)]
    pub earnings_yesterday: Option<f64>,
    /// Lifetime earnings. Only a rollup adds to it after creation.
    #[serde(default)]
    pub total_earnings: f64,
    #[serde(default)]
    pub return_rate: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn new(id: FundId) -> Self {
        Self {
            id,
            fund_name: None,
            amount: None,
            earnings_yesterday: None,
            total_earnings: 0.0,
            return_rate: None,
            notes: None,
            updated_at: Utc::now(),
        }
    }
}

/// Profit computed for one position at one settlement slot.
/// Unique per `(user_id, date, time_slot, code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySettlementRecord {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub time_slot: String,
    pub code: FundCode,
    #[serde(default)]
    pub fund_name: Option<String>,
    pub amount: f64,
    pub pct: f64,
    pub profit: f64,
    pub written_at: DateTime<Utc>,
}

/// The last settlement run that completed without a storage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRunStatus {
    pub date: NaiveDate,
    pub slot: String,
    pub timestamp: DateTime<Utc>,
}

/// A change to one position's lifetime earnings produced by a rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupEntry {
    pub code: FundCode,
    /// Amount added to `total_earnings`.
    pub delta: f64,
    /// Snapshot profit sum for the date that is accounted for once committed.
    pub applied: f64,
}

/// Persistence for positions, settlement snapshots and rollup bookkeeping.
///
/// Upserts replace any existing value under the same key. Implementations are
/// shared by every user in the process; callers serialise settlement runs.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Users that currently hold at least one position, ascending.
    async fn users(&self) -> Result<Vec<UserId>>;

    /// A user's positions ordered by id.
    async fn positions(&self, user: UserId) -> Result<Vec<PositionRecord>>;

    async fn position(&self, user: UserId, id: &FundId) -> Result<Option<PositionRecord>>;

    async fn upsert_position(&self, user: UserId, record: &PositionRecord) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete_position(&self, user: UserId, id: &FundId) -> Result<bool>;

    /// Sets `earnings_yesterday`, the derived `return_rate` and `updated_at`
    /// on an existing position, leaving every other field as stored. Returns
    /// `false` without writing when the position no longer exists.
    async fn record_latest_profit(
        &self,
        user: UserId,
        id: &FundId,
        profit: f64,
        pct: f64,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn upsert_snapshot(&self, record: &DailySettlementRecord) -> Result<()>;

    /// With a date: that day's records ordered by slot then code. Without:
    /// the [`RECENT_SNAPSHOT_LIMIT`] newest records, newest first.
    async fn snapshots(
        &self,
        user: UserId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailySettlementRecord>>;

    /// Sum of snapshot profit per code over every slot of `date`.
    async fn sum_daily_profit_by_code(
        &self,
        user: UserId,
        date: NaiveDate,
    ) -> Result<BTreeMap<FundCode, f64>>;

    /// Snapshot profit per code already added to lifetime earnings for `date`.
    async fn rolled_up(&self, user: UserId, date: NaiveDate) -> Result<BTreeMap<FundCode, f64>>;

    /// Adds each entry's delta to the matching position's `total_earnings` and
    /// records its applied sum. All entries are written or none are.
    async fn commit_rollup(
        &self,
        user: UserId,
        date: NaiveDate,
        entries: &[RollupEntry],
    ) -> Result<()>;

    async fn load_run_status(&self) -> Result<Option<SettlementRunStatus>>;

    async fn save_run_status(&self, status: &SettlementRunStatus) -> Result<()>;
}

/// Orders snapshot records the way [`LedgerStore::snapshots`] returns them.
pub(crate) fn order_snapshots(
    mut records: Vec<DailySettlementRecord>,
    date: Option<NaiveDate>,
) -> Vec<DailySettlementRecord> {
    match date {
        Some(_) => {
            records.sort_by(|a, b| (&a.time_slot, &a.code).cmp(&(&b.time_slot, &b.code)));
            records
        }
        None => {
            records.sort_by(|a, b| {
                (&b.date, &b.time_slot, &b.code).cmp(&(&a.date, &a.time_slot, &a.code))
            });
            records.truncate(RECENT_SNAPSHOT_LIMIT);
            records
        }
    }
}

/// Sums snapshot profit per code.
pub fn sum_profit_by_code<'a>(
    records: impl IntoIterator<Item = &'a DailySettlementRecord>,
) -> BTreeMap<FundCode, f64> {
    let mut sums = BTreeMap::new();
    for record in records {
        *sums.entry(record.code.clone()).or_insert(0.0) += record.profit;
    }
    sums
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn code(raw: &str) -> FundCode {
        FundCode::parse(raw).unwrap()
    }

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn snapshot(
        user: UserId,
        date: NaiveDate,
        slot: &str,
        fund: &str,
        profit: f64,
    ) -> DailySettlementRecord {
        DailySettlementRecord {
            user_id: user,
            date,
            time_slot: slot.to_string(),
            code: code(fund),
            fund_name: None,
            amount: 1000.0,
            pct: profit / 10.0,
            profit,
            written_at: Utc::now(),
        }
    }

    pub fn position(fund: &str, amount: f64) -> PositionRecord {
        let mut record = PositionRecord::new(FundId::Resolved(code(fund)));
        record.amount = Some(amount);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_sum_profit_by_code_groups_slots() {
        let d = date(2024, 5, 6);
        let records = vec![
            snapshot(1, d, "18:00", "000001", 5.0),
            snapshot(1, d, "18:30", "000001", -2.0),
            snapshot(1, d, "18:00", "110022", 1.5),
        ];
        let sums = sum_profit_by_code(&records);
        assert_eq!(sums.get(&code("000001")), Some(&3.0));
        assert_eq!(sums.get(&code("110022")), Some(&1.5));
    }

    #[test]
    fn test_order_snapshots_dated_is_by_slot() {
        let d = date(2024, 5, 6);
        let ordered = order_snapshots(
            vec![
                snapshot(1, d, "23:50", "000001", 1.0),
                snapshot(1, d, "18:00", "000002", 1.0),
                snapshot(1, d, "18:00", "000001", 1.0),
            ],
            Some(d),
        );
        let keys: Vec<_> = ordered
            .iter()
            .map(|r| format!("{} {}", r.time_slot, r.code))
            .collect();
        assert_eq!(keys, vec!["18:00 000001", "18:00 000002", "23:50 000001"]);
    }

    #[test]
    fn test_order_snapshots_undated_is_newest_first_and_capped() {
        let mut records = Vec::new();
        for day in 1..=28 {
            for slot in ["18:00", "18:30"] {
                for i in 0..10 {
                    records.push(snapshot(1, date(2024, 2, day), slot, &format!("00000{i}"), 1.0));
                }
            }
        }
        let ordered = order_snapshots(records, None);
        assert_eq!(ordered.len(), RECENT_SNAPSHOT_LIMIT);
        assert_eq!(ordered[0].date, date(2024, 2, 28));
        assert_eq!(ordered[0].time_slot, "18:30");
    }
}
