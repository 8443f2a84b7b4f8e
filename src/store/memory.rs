use crate::core::fund::{FundCode, FundDirectory, FundDirectoryWriter, FundId, FundProfile};
use crate::core::ledger::{
    DailySettlementRecord, LedgerStore, PositionRecord, RollupEntry, SettlementRunStatus, UserId,
    order_snapshots, sum_profit_by_code,
};
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::debug;

type SnapshotKey = (UserId, NaiveDate, String, FundCode);

#[derive(Default)]
struct Inner {
    funds: BTreeMap<FundCode, FundProfile>,
    positions: BTreeMap<(UserId, FundId), PositionRecord>,
    snapshots: BTreeMap<SnapshotKey, DailySettlementRecord>,
    rollups: BTreeMap<(UserId, NaiveDate, FundCode), f64>,
    status: Option<SettlementRunStatus>,
}

/// Process-local store. Holds the fund directory and the ledger behind one
/// lock, so every operation observes a consistent state.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FundDirectory for MemoryStore {
    async fn get_profile(&self, code: &FundCode) -> Result<Option<FundProfile>> {
        Ok(self.inner.lock().await.funds.get(code).cloned())
    }

    async fn list_all(&self) -> Result<Vec<(FundCode, String)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .funds
            .values()
            .map(|p| (p.code.clone(), p.name.clone()))
            .collect())
    }
}

#[async_trait]
impl FundDirectoryWriter for MemoryStore {
    async fn upsert_profile(&self, profile: &FundProfile) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.funds.insert(profile.code.clone(), profile.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn users(&self) -> Result<Vec<UserId>> {
        let inner = self.inner.lock().await;
        let users: BTreeSet<UserId> = inner.positions.keys().map(|(user, _)| *user).collect();
        Ok(users.into_iter().collect())
    }

    async fn positions(&self, user: UserId) -> Result<Vec<PositionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .positions
            .iter()
            .filter(|((u, _), _)| *u == user)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn position(&self, user: UserId, id: &FundId) -> Result<Option<PositionRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.positions.get(&(user, id.clone())).cloned())
    }

    async fn upsert_position(&self, user: UserId, record: &PositionRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .positions
            .insert((user, record.id.clone()), record.clone());
        Ok(())
    }

    async fn delete_position(&self, user: UserId, id: &FundId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.positions.remove(&(user, id.clone())).is_some())
    }

    async fn record_latest_profit(
        &self,
        user: UserId,
        id: &FundId,
        profit: f64,
        pct: f64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(position) = inner.positions.get_mut(&(user, id.clone())) else {
            return Ok(false);
        };
        position.earnings_yesterday = Some(profit);
        position.return_rate = Some(pct);
        position.updated_at = at;
        Ok(true)
    }

    async fn upsert_snapshot(&self, record: &DailySettlementRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = (
            record.user_id,
            record.date,
            record.time_slot.clone(),
            record.code.clone(),
        );
        inner.snapshots.insert(key, record.clone());
        Ok(())
    }

    async fn snapshots(
        &self,
        user: UserId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailySettlementRecord>> {
        let inner = self.inner.lock().await;
        let records = inner
            .snapshots
            .values()
            .filter(|r| r.user_id == user && date.is_none_or(|d| r.date == d))
            .cloned()
            .collect();
        Ok(order_snapshots(records, date))
    }

    async fn sum_daily_profit_by_code(
        &self,
        user: UserId,
        date: NaiveDate,
    ) -> Result<BTreeMap<FundCode, f64>> {
        let inner = self.inner.lock().await;
        Ok(sum_profit_by_code(
            inner
                .snapshots
                .values()
                .filter(|r| r.user_id == user && r.date == date),
        ))
    }

    async fn rolled_up(&self, user: UserId, date: NaiveDate) -> Result<BTreeMap<FundCode, f64>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rollups
            .iter()
            .filter(|((u, d, _), _)| *u == user && *d == date)
            .map(|((_, _, code), applied)| (code.clone(), *applied))
            .collect())
    }

    async fn commit_rollup(
        &self,
        user: UserId,
        date: NaiveDate,
        entries: &[RollupEntry],
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        // Validate everything first so a missing position leaves no partial update.
        for entry in entries {
            let id = FundId::Resolved(entry.code.clone());
            if !inner.positions.contains_key(&(user, id)) {
                bail!("No position {} for user {user}", entry.code);
            }
        }
        let now = Utc::now();
        for entry in entries {
            let id = FundId::Resolved(entry.code.clone());
            if let Some(position) = inner.positions.get_mut(&(user, id)) {
                position.total_earnings += entry.delta;
                position.updated_at = now;
            }
            inner
                .rollups
                .insert((user, date, entry.code.clone()), entry.applied);
        }
        debug!(user, date = %date, entries = entries.len(), "Committed rollup");
        Ok(())
    }

    async fn load_run_status(&self) -> Result<Option<SettlementRunStatus>> {
        Ok(self.inner.lock().await.status.clone())
    }

    async fn save_run_status(&self, status: &SettlementRunStatus) -> Result<()> {
        self.inner.lock().await.status = Some(status.clone());
        Ok(())
    }
}
