//! Turns point-in-time percentage estimates into per-slot profit snapshots
//! and rolls each day's snapshots into lifetime earnings.
//!
//! Runs are serialised by a single engine-wide lock: the scheduled loop and
//! any manual trigger or recompute never interleave. A rollup for a date only
//! ever adds the part of that date's snapshot profit not yet accounted for, so
//! repeated rollups and recomputes cannot double count.

use crate::core::fund::{FundCode, FundDirectory, FundId};
use crate::core::ledger::{
    DailySettlementRecord, LedgerStore, PositionRecord, RollupEntry, SettlementRunStatus, UserId,
};
use crate::core::market::{MarketDataProvider, PctSource, select_pct};
use crate::core::schedule::SlotTable;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

/// Deltas smaller than this are treated as already applied.
const ROLLUP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRun {
    /// Positions for which a snapshot was written.
    pub count: usize,
    /// Resolved positions skipped because no valuation was available.
    pub skipped: usize,
    pub date: NaiveDate,
    pub slot: String,
    pub timestamp: DateTime<Utc>,
    pub rolled_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecomputeOutcome {
    pub updated_count: usize,
}

/// `amount * pct / 100`, with non-finite or missing inputs counted as zero.
pub fn compute_profit(amount: Option<f64>, pct: f64) -> f64 {
    let amount = amount.filter(|a| a.is_finite()).unwrap_or(0.0);
    let pct = if pct.is_finite() { pct } else { 0.0 };
    amount * pct / 100.0
}

/// Entries that bring each held code's lifetime earnings up to date with
/// `sums`, given the portion already `applied` for the same date.
pub fn rollup_entries(
    held: &BTreeSet<FundCode>,
    sums: &BTreeMap<FundCode, f64>,
    applied: &BTreeMap<FundCode, f64>,
) -> Vec<RollupEntry> {
    sums.iter()
        .filter(|(code, _)| held.contains(*code))
        .filter_map(|(code, sum)| {
            let delta = sum - applied.get(code).copied().unwrap_or(0.0);
            (delta.abs() > ROLLUP_EPSILON).then(|| RollupEntry {
                code: code.clone(),
                delta,
                applied: *sum,
            })
        })
        .collect()
}

#[derive(Default)]
struct UserTally {
    settled: usize,
    skipped: usize,
}

pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn FundDirectory>,
    market: Arc<dyn MarketDataProvider>,
    slots: SlotTable,
    run_lock: Mutex<()>,
    status: RwLock<Option<SettlementRunStatus>>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn FundDirectory>,
        market: Arc<dyn MarketDataProvider>,
        slots: SlotTable,
    ) -> Self {
        Self {
            store,
            directory,
            market,
            slots,
            run_lock: Mutex::new(()),
            status: RwLock::new(None),
        }
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Loads the last successful run persisted by a previous process.
    pub async fn restore_status(&self) -> Result<()> {
        let persisted = self.store.load_run_status().await?;
        *self.status.write().await = persisted;
        Ok(())
    }

    /// The last run that completed successfully.
    pub async fn status(&self) -> Option<SettlementRunStatus> {
        self.status.read().await.clone()
    }

    /// Out-of-band run labelled after the slot nearest to now.
    pub async fn trigger(&self, do_rollup: bool) -> Result<SettlementRun> {
        let now = Local::now();
        let label = self.slots.label_for(now.naive_local());
        self.settle_at(&label, do_rollup, now).await
    }

    /// Settles every resolved position of every user for `slot` on the local
    /// date of `now`. A storage failure aborts the run and leaves the status
    /// untouched; a missing valuation only skips that position.
    #[instrument(name = "Settlement", skip_all, fields(slot = %slot, rollup = do_rollup))]
    pub async fn settle_at(
        &self,
        slot: &str,
        do_rollup: bool,
        now: DateTime<Local>,
    ) -> Result<SettlementRun> {
        let _run = self.run_lock.lock().await;
        let date = now.date_naive();
        let timestamp = now.with_timezone(&Utc);

        let mut count = 0;
        let mut skipped = 0;
        for user in self.store.users().await? {
            let tally = self
                .settle_user(user, date, slot, timestamp)
                .await
                .with_context(|| format!("Settlement failed for user {user}"))?;
            count += tally.settled;
            skipped += tally.skipped;

            if do_rollup {
                let rolled = self
                    .roll_up_user(user, date)
                    .await
                    .with_context(|| format!("Rollup failed for user {user}"))?;
                debug!(user, date = %date, positions = rolled, "Rolled up daily profit");
            }
        }

        let status = SettlementRunStatus {
            date,
            slot: slot.to_string(),
            timestamp,
        };
        self.store.save_run_status(&status).await?;
        *self.status.write().await = Some(status);

        info!(count, skipped, date = %date, "Settlement run completed");
        Ok(SettlementRun {
            count,
            skipped,
            date,
            slot: slot.to_string(),
            timestamp,
            rolled_up: do_rollup,
        })
    }

    /// Adds the not yet applied part of `date`'s snapshot profit to each of
    /// the user's positions. Shares its bookkeeping with the scheduled rollup,
    /// so running both for one date counts the profit once.
    pub async fn recompute_totals(&self, user: UserId, date: NaiveDate) -> Result<RecomputeOutcome> {
        let _run = self.run_lock.lock().await;
        let updated_count = self.roll_up_user(user, date).await?;
        info!(user, date = %date, updated_count, "Recomputed lifetime earnings");
        Ok(RecomputeOutcome { updated_count })
    }

    pub async fn daily_snapshots(
        &self,
        user: UserId,
        date: Option<NaiveDate>,
    ) -> Result<Vec<DailySettlementRecord>> {
        self.store.snapshots(user, date).await
    }

    async fn settle_user(
        &self,
        user: UserId,
        date: NaiveDate,
        slot: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<UserTally> {
        let mut tally = UserTally::default();
        for position in self.store.positions(user).await? {
            let Some(code) = position.id.code() else {
                debug!(user, id = %position.id, "Skipping unresolved position");
                continue;
            };
            let Some((pct, source)) = self.current_pct(code, date).await else {
                debug!(user, code = %code, "No valuation available, skipping");
                tally.skipped += 1;
                continue;
            };

            // Provider calls may take a while; settle against the current record.
            let Some(current) = self.store.position(user, &position.id).await? else {
                debug!(user, code = %code, "Position removed during settlement");
                continue;
            };
            let profit = compute_profit(current.amount, pct);
            if !self
                .store
                .record_latest_profit(user, &current.id, profit, pct, timestamp)
                .await?
            {
                debug!(user, code = %code, "Position removed during settlement");
                continue;
            }

            let record = DailySettlementRecord {
                user_id: user,
                date,
                time_slot: slot.to_string(),
                code: code.clone(),
                fund_name: self.fund_name(code, &current).await,
                amount: current.amount.filter(|a| a.is_finite()).unwrap_or(0.0),
                pct,
                profit,
                written_at: timestamp,
            };
            self.store.upsert_snapshot(&record).await?;

            debug!(user, code = %code, pct, ?source, profit, "Settled position");
            tally.settled += 1;
        }
        Ok(tally)
    }

    async fn roll_up_user(&self, user: UserId, date: NaiveDate) -> Result<usize> {
        let held: BTreeSet<FundCode> = self
            .store
            .positions(user)
            .await?
            .into_iter()
            .filter_map(|p| match p.id {
                FundId::Resolved(code) => Some(code),
                FundId::Unresolved(_) => None,
            })
            .collect();
        let sums = self.store.sum_daily_profit_by_code(user, date).await?;
        let applied = self.store.rolled_up(user, date).await?;

        let entries = rollup_entries(&held, &sums, &applied);
        if !entries.is_empty() {
            self.store.commit_rollup(user, date, &entries).await?;
        }
        Ok(entries.len())
    }

    async fn current_pct(&self, code: &FundCode, today: NaiveDate) -> Option<(f64, PctSource)> {
        let official = self.market.fetch_official_change(code).await;
        let estimate = if official.as_ref().is_some_and(|c| c.date == today) {
            None
        } else {
            self.market.fetch_estimation(code).await
        };
        select_pct(official.as_ref(), estimate.as_ref(), today)
    }

    async fn fund_name(&self, code: &FundCode, position: &PositionRecord) -> Option<String> {
        match self.directory.get_profile(code).await {
            Ok(Some(profile)) => Some(profile.name),
            Ok(None) => position.fund_name.clone(),
            Err(e) => {
                warn!(code = %code, error = %e, "Fund directory lookup failed");
                position.fund_name.clone()
            }
        }
    }
}
