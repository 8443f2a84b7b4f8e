use crate::core::fund::{FundCode, FundDirectory, FundDirectoryWriter, FundId, FundProfile};
use crate::core::ledger::{
    DailySettlementRecord, LedgerStore, PositionRecord, RECENT_SNAPSHOT_LIMIT, RollupEntry,
    SettlementRunStatus, UserId, sum_profit_by_code,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;

const STATUS_KEY: &str = "settlement_status";

fn user_key(user: UserId, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + suffix.len());
    key.extend_from_slice(&user.to_be_bytes());
    key.extend_from_slice(suffix);
    key
}

fn position_key(user: UserId, id: &FundId) -> Result<Vec<u8>> {
    Ok(user_key(user, &serde_json::to_vec(id)?))
}

/// `YYYY-MM-DD|` so a date prefix scan yields that day's slots in order.
fn date_prefix(user: UserId, date: NaiveDate) -> Vec<u8> {
    user_key(user, format!("{}|", date.format("%Y-%m-%d")).as_bytes())
}

fn snapshot_key(record: &DailySettlementRecord) -> Vec<u8> {
    let mut key = date_prefix(record.user_id, record.date);
    key.extend_from_slice(format!("{}|{}", record.time_slot, record.code).as_bytes());
    key
}

fn rollup_key(user: UserId, date: NaiveDate, code: &FundCode) -> Vec<u8> {
    let mut key = date_prefix(user, date);
    key.extend_from_slice(code.as_str().as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).context("Failed to encode record")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).context("Failed to decode stored record")
}

/// Persistent store on a `fjall` keyspace. Keys start with the big-endian
/// user id, so a prefix scan covers exactly one user.
///
/// Position writes hold `position_lock`, so a read-modify-write of one
/// position never interleaves with a delete or another update.
pub struct DiskStore {
    keyspace: Keyspace,
    position_lock: Mutex<()>,
    funds: PartitionHandle,
    positions: PartitionHandle,
    snapshots: PartitionHandle,
    rollups: PartitionHandle,
    meta: PartitionHandle,
}

impl DiskStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create data dir: {}", path.display()))?;
        let keyspace = fjall::Config::new(path.join("ledger"))
            .open()
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        let partition = |name: &str| {
            keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .with_context(|| format!("Failed to open partition {name}"))
        };
        let funds = partition("funds")?;
        let positions = partition("positions")?;
        let snapshots = partition("snapshots")?;
        let rollups = partition("rollups")?;
        let meta = partition("meta")?;
        debug!(path = %path.display(), "Opened disk store");

        Ok(Self {
            keyspace,
            position_lock: Mutex::new(()),
            funds,
            positions,
            snapshots,
            rollups,
            meta,
        })
    }

    fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::Buffer)
            .context("Failed to persist store journal")
    }

    fn scan<T: DeserializeOwned>(partition: &PartitionHandle, prefix: &[u8]) -> Result<Vec<T>> {
        partition
            .prefix(prefix)
            .map(|kv| {
                let (_, value) = kv?;
                decode(&value)
            })
            .collect()
    }
}

#[async_trait]
impl FundDirectory for DiskStore {
    async fn get_profile(&self, code: &FundCode) -> Result<Option<FundProfile>> {
        self.funds
            .get(code.as_str())?
            .map(|value| decode(&value))
            .transpose()
    }

    async fn list_all(&self) -> Result<Vec<(FundCode, String)>> {
        let profiles: Vec<FundProfile> = Self::scan(&self.funds, b"")?;
        Ok(profiles.into_iter().map(|p| (p.code, p.name)).collect())
    }
}

#[async_trait]
impl FundDirectoryWriter for DiskStore {
    async fn upsert_profile(&self, profile: &FundProfile) -> Result<()> {
        self.funds
            .insert(profile.code.as_str(), encode(profile)?)?;
        self.persist()
    }
}

#[async_trait]
impl LedgerStore for DiskStore {
    async fn users(&self) -> Result<Vec<UserId>> {
        let mut users = BTreeSet::new();
        for kv in self.positions.iter() {
            let (key, _) = kv?;
            let prefix: [u8; 8] = key
                .get(..8)
                .and_then(|p| p.try_into().ok())
                .context("Malformed position key")?;
            users.insert(UserId::from_be_bytes(prefix));
        }
        Ok(users.into_iter().collect())
    }

    async fn positions(&self, user: UserId) -> Result<Vec<PositionRecord>> {
        Self::scan(&self.positions, &user.to_be_bytes())
    }

    async fn position(&self, user: UserId, id: &FundId) -> Result<Option<PositionRecord>> {
        self.positions
            .get(position_key(user, id)?)?
            .map(|value| decode(&value))
            .transpose()
    }

    async fn upsert_position(&self, user: UserId, record: &PositionRecord) -> Result<()> {
        let _guard = self.position_lock.lock().await;
        self.positions
            .insert(position_key(user, &record.id)?, encode(record)?)?;
        self.persist()
    }

    async fn delete_position(&self, user: UserId, id: &FundId) -> Result<bool> {
        let key = position_key(user, id)?;
        let _guard = self.position_lock.lock().await;
        if !self.positions.contains_key(&key)? {
            return Ok(false);
        }
        self.positions.remove(key)?;
        self.persist()?;
        Ok(true)
    }

    async fn record_latest_profit(
        &self,
        user: UserId,
        id: &FundId,
        profit: f64,
        pct: f64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let key = position_key(user, id)?;
        let _guard = self.position_lock.lock().await;
        let Some(value) = self.positions.get(&key)? else {
            return Ok(false);
        };
        let mut position: PositionRecord = decode(&value)?;
        position.earnings_yesterday = Some(profit);
        position.return_rate = Some(pct);
        position.updated_at = at;
        self.positions.insert(key, encode(&position)?)?;
        self.persist()?;
        Ok(true)
    }

    async fn upsert_snapshot(&self, record: &DailySettlementRecord) -> Result<()> {
        self.snapshots
            .insert(snapshot_key(record), encode(record)?)?;
        self.persist()
    }

    async fn snapshots(
        &self,
        user: UserId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailySettlementRecord>> {
        match date {
            Some(date) => Self::scan(&self.snapshots, &date_prefix(user, date)),
            None => self
                .snapshots
                .prefix(user.to_be_bytes())
                .rev()
                .take(RECENT_SNAPSHOT_LIMIT)
                .map(|kv| {
                    let (_, value) = kv?;
                    decode(&value)
                })
                .collect(),
        }
    }

    async fn sum_daily_profit_by_code(
        &self,
        user: UserId,
        date: NaiveDate,
    ) -> Result<BTreeMap<FundCode, f64>> {
        let records: Vec<DailySettlementRecord> =
            Self::scan(&self.snapshots, &date_prefix(user, date))?;
        Ok(sum_profit_by_code(&records))
    }

    async fn rolled_up(&self, user: UserId, date: NaiveDate) -> Result<BTreeMap<FundCode, f64>> {
        let prefix = date_prefix(user, date);
        let mut applied = BTreeMap::new();
        for kv in self.rollups.prefix(&prefix) {
            let (key, value) = kv?;
            let code = std::str::from_utf8(&key[prefix.len()..])
                .ok()
                .and_then(FundCode::parse)
                .context("Malformed rollup key")?;
            applied.insert(code, decode::<f64>(&value)?);
        }
        Ok(applied)
    }

    async fn commit_rollup(
        &self,
        user: UserId,
        date: NaiveDate,
        entries: &[RollupEntry],
    ) -> Result<()> {
        let now = Utc::now();
        let _guard = self.position_lock.lock().await;
        let mut batch = self.keyspace.batch();
        for entry in entries {
            let id = FundId::Resolved(entry.code.clone());
            let key = position_key(user, &id)?;
            let Some(value) = self.positions.get(&key)? else {
                bail!("No position {} for user {user}", entry.code);
            };
            let mut position: PositionRecord = decode(&value)?;
            position.total_earnings += entry.delta;
            position.updated_at = now;
            batch.insert(&self.positions, key, encode(&position)?);
            batch.insert(
                &self.rollups,
                rollup_key(user, date, &entry.code),
                encode(&entry.applied)?,
            );
        }
        batch.commit().context("Failed to commit rollup")?;
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("Failed to persist rollup")?;
        debug!(user, date = %date, entries = entries.len(), "Committed rollup");
        Ok(())
    }

    async fn load_run_status(&self) -> Result<Option<SettlementRunStatus>> {
        self.meta
            .get(STATUS_KEY)?
            .map(|value| decode(&value))
            .transpose()
    }

    async fn save_run_status(&self, status: &SettlementRunStatus) -> Result<()> {
        self.meta.insert(STATUS_KEY, encode(status)?)?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::test_support::{code, date, position, snapshot};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_positions_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).unwrap();
            store.upsert_position(3, &position("000001", 100.0)).await.unwrap();
            store
                .upsert_position(3, &PositionRecord::new(FundId::Unresolved("某基金".into())))
                .await
                .unwrap();
            store.upsert_position(1, &position("000002", 50.0)).await.unwrap();
        }

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store.users().await.unwrap(), vec![1, 3]);
        let ids: Vec<_> = store
            .positions(3)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                FundId::Resolved(code("000001")),
                FundId::Unresolved("某基金".into())
            ]
        );
        let held = store
            .position(1, &FundId::Resolved(code("000002")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.amount, Some(50.0));
    }

    #[tokio::test]
    async fn test_delete_position() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let id = FundId::Resolved(code("000001"));
        store.upsert_position(1, &position("000001", 100.0)).await.unwrap();

        assert!(store.delete_position(1, &id).await.unwrap());
        assert!(!store.delete_position(1, &id).await.unwrap());
        assert!(store.users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_latest_profit_touches_only_settled_fields() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let id = FundId::Resolved(code("000001"));
        let mut held = position("000001", 100.0);
        held.total_earnings = 7.0;
        held.notes = Some("定投".to_string());
        store.upsert_position(1, &held).await.unwrap();

        let at = Utc::now();
        assert!(store.record_latest_profit(1, &id, 1.5, 1.5, at).await.unwrap());
        let stored = store.position(1, &id).await.unwrap().unwrap();
        assert_eq!(stored.earnings_yesterday, Some(1.5));
        assert_eq!(stored.return_rate, Some(1.5));
        assert_eq!(stored.updated_at, at);
        assert_eq!(stored.total_earnings, 7.0);
        assert_eq!(stored.notes.as_deref(), Some("定投"));

        store.delete_position(1, &id).await.unwrap();
        assert!(!store.record_latest_profit(1, &id, 2.0, 2.0, at).await.unwrap());
        assert!(store.position(1, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshots_by_date_and_recent() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let (d1, d2) = (date(2024, 6, 3), date(2024, 6, 4));
        store.upsert_snapshot(&snapshot(1, d1, "18:30", "000001", 2.0)).await.unwrap();
        store.upsert_snapshot(&snapshot(1, d1, "18:00", "000001", 1.0)).await.unwrap();
        store.upsert_snapshot(&snapshot(1, d1, "18:00", "000001", 4.0)).await.unwrap();
        store.upsert_snapshot(&snapshot(1, d2, "18:00", "000002", 8.0)).await.unwrap();
        store.upsert_snapshot(&snapshot(2, d1, "18:00", "000001", 9.0)).await.unwrap();

        let day: Vec<_> = store
            .snapshots(1, Some(d1))
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.time_slot, r.profit))
            .collect();
        assert_eq!(day, vec![("18:00".to_string(), 4.0), ("18:30".to_string(), 2.0)]);

        let recent = store.snapshots(1, None).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].date, d2);

        let sums = store.sum_daily_profit_by_code(1, d1).await.unwrap();
        assert_eq!(sums.get(&code("000001")), Some(&6.0));
    }

    #[tokio::test]
    async fn test_commit_rollup_updates_totals_and_ledger() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let d = date(2024, 6, 3);
        store.upsert_position(1, &position("000001", 100.0)).await.unwrap();

        store
            .commit_rollup(
                1,
                d,
                &[RollupEntry {
                    code: code("000001"),
                    delta: 2.5,
                    applied: 2.5,
                }],
            )
            .await
            .unwrap();
        let held = store
            .position(1, &FundId::Resolved(code("000001")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.total_earnings, 2.5);
        assert_eq!(store.rolled_up(1, d).await.unwrap().get(&code("000001")), Some(&2.5));
        assert!(store.rolled_up(1, date(2024, 6, 4)).await.unwrap().is_empty());

        let missing = RollupEntry {
            code: code("999999"),
            delta: 1.0,
            applied: 1.0,
        };
        assert!(store.commit_rollup(1, d, &[missing]).await.is_err());
    }

    #[tokio::test]
    async fn test_run_status_and_directory_round_trip() {
        let dir = tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        assert!(store.load_run_status().await.unwrap().is_none());

        let status = SettlementRunStatus {
            date: date(2024, 6, 3),
            slot: "23:50".to_string(),
            timestamp: Utc::now(),
        };
        store.save_run_status(&status).await.unwrap();
        assert_eq!(store.load_run_status().await.unwrap(), Some(status));

        let profile = FundProfile {
            code: code("161039"),
            name: "富国中证新能源汽车指数(LOF)A".to_string(),
            fund_type: Some("指数型-股票".to_string()),
            company: Some("富国基金".to_string()),
            managers: vec!["张圣贤".to_string()],
        };
        store.upsert_profile(&profile).await.unwrap();
        assert_eq!(store.get_profile(&code("161039")).await.unwrap(), Some(profile));
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }
}
