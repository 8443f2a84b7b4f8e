//! User-facing edits to the position ledger.

use crate::core::fund::{FundCode, FundDirectory, FundId};
use crate::core::ledger::{LedgerStore, PositionRecord, UserId};
use crate::core::resolver::Resolver;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A holding to add. Either `code` or `name` must be given.
#[derive(Debug, Clone, Default)]
pub struct NewPosition {
    pub code: Option<String>,
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub earnings_yesterday: Option<f64>,
    pub total_earnings: Option<f64>,
    pub return_rate: Option<f64>,
    pub notes: Option<String>,
}

/// Field-wise edit. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    pub code: Option<String>,
    pub fund_name: Option<String>,
    pub amount: Option<f64>,
    pub earnings_yesterday: Option<f64>,
    pub total_earnings: Option<f64>,
    pub return_rate: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportOutcome {
    pub count: usize,
    /// Names kept as unresolved positions.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOutcome {
    pub completed: Vec<(String, FundCode)>,
    pub not_found: Vec<String>,
    /// Names that resolved to a code the user already holds.
    pub already_held: Vec<(String, FundCode)>,
}

pub struct PositionLedger {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn FundDirectory>,
    resolver: Arc<Resolver>,
}

impl PositionLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn FundDirectory>,
        resolver: Arc<Resolver>,
    ) -> Self {
        Self {
            store,
            directory,
            resolver,
        }
    }

    /// Positions ordered by last update, newest first.
    pub async fn list(&self, user: UserId) -> Result<Vec<PositionRecord>> {
        let mut positions = self.store.positions(user).await?;
        positions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(positions)
    }

    /// Adds or replaces a holding. A name that cannot be resolved is kept as
    /// an unresolved position rather than rejected.
    pub async fn add(&self, user: UserId, new: NewPosition) -> Result<FundId> {
        let (id, directory_name) = match new.code.as_deref().and_then(FundCode::parse) {
            Some(code) => {
                let name = self.directory_name(&code).await?;
                (FundId::Resolved(code), name)
            }
            None => {
                let Some(name) = new.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
                else {
                    bail!("A position needs a fund code or a fund name");
                };
                match self.resolver.resolve_match(name).await? {
                    Some(m) => (FundId::Resolved(m.code), Some(m.name)),
                    None => (FundId::Unresolved(name.to_string()), None),
                }
            }
        };

        let mut record = self
            .store
            .position(user, &id)
            .await?
            .unwrap_or_else(|| PositionRecord::new(id.clone()));
        record.fund_name = directory_name.or(new.name).or(record.fund_name);
        record.amount = new.amount.or(record.amount);
        record.earnings_yesterday = new.earnings_yesterday.or(record.earnings_yesterday);
        record.total_earnings = new.total_earnings.unwrap_or(record.total_earnings);
        record.return_rate = new.return_rate.or(record.return_rate);
        record.notes = new.notes.or(record.notes);
        record.updated_at = Utc::now();

        self.store.upsert_position(user, &record).await?;
        debug!(user, id = %id, "Position saved");
        Ok(id)
    }

    pub async fn import(&self, user: UserId, items: Vec<NewPosition>) -> Result<ImportOutcome> {
        let mut outcome = ImportOutcome::default();
        for item in items {
            match self.add(user, item).await? {
                FundId::Unresolved(name) => outcome.unresolved.push(name),
                FundId::Resolved(_) => {}
            }
            outcome.count += 1;
        }
        info!(user, count = outcome.count, unresolved = outcome.unresolved.len(), "Imported positions");
        Ok(outcome)
    }

    /// Applies `update` to the position `id`. Changing the code re-keys the
    /// position; the new code must be known to the directory and not already
    /// held. Returns the position's id after the edit.
    pub async fn update(&self, user: UserId, id: &FundId, update: PositionUpdate) -> Result<FundId> {
        let Some(mut record) = self.store.position(user, id).await? else {
            bail!("No position {id} for user {user}");
        };

        let new_code = update.code.as_deref().and_then(FundCode::parse);
        let rekey = new_code.filter(|code| id.code() != Some(code));
        if let Some(code) = &rekey {
            let profile = self
                .directory
                .get_profile(code)
                .await?
                .with_context(|| format!("Unknown fund code {code}"))?;
            let new_id = FundId::Resolved(code.clone());
            if self.store.position(user, &new_id).await?.is_some() {
                bail!("Fund {code} is already held by user {user}");
            }
            record.id = new_id;
            record.fund_name = Some(profile.name);
        }

        if let Some(name) = update.fund_name {
            record.fund_name = Some(name);
        }
        record.amount = update.amount.or(record.amount);
        record.earnings_yesterday = update.earnings_yesterday.or(record.earnings_yesterday);
        record.total_earnings = update.total_earnings.unwrap_or(record.total_earnings);
        record.return_rate = update.return_rate.or(record.return_rate);
        record.notes = update.notes.or(record.notes);
        record.updated_at = Utc::now();

        if rekey.is_some() {
            self.store.delete_position(user, id).await?;
            info!(user, from = %id, to = %record.id, "Position re-keyed");
        }
        self.store.upsert_position(user, &record).await?;
        Ok(record.id)
    }

    pub async fn remove(&self, user: UserId, id: &FundId) -> Result<bool> {
        self.store.delete_position(user, id).await
    }

    /// Returns how many of `ids` existed and were removed.
    pub async fn remove_many(&self, user: UserId, ids: &[FundId]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.store.delete_position(user, id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub async fn clear(&self, user: UserId) -> Result<usize> {
        let ids: Vec<FundId> = self
            .store
            .positions(user)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        self.remove_many(user, &ids).await
    }

    /// Retries name resolution for every unresolved position of `user`.
    pub async fn complete_codes(&self, user: UserId) -> Result<CompletionOutcome> {
        self.resolver.refresh().await;
        let mut outcome = CompletionOutcome::default();
        for record in self.store.positions(user).await? {
            let FundId::Unresolved(name) = &record.id else {
                continue;
            };
            let Some(found) = self.resolver.resolve_match(name).await? else {
                outcome.not_found.push(name.clone());
                continue;
            };

            let new_id = FundId::Resolved(found.code.clone());
            if self.store.position(user, &new_id).await?.is_some() {
                warn!(user, name = %name, code = %found.code, "Resolved code is already held");
                outcome.already_held.push((name.clone(), found.code));
                continue;
            }

            let mut updated = record.clone();
            updated.id = new_id;
            updated.fund_name = Some(found.name);
            updated.updated_at = Utc::now();
            self.store.delete_position(user, &record.id).await?;
            self.store.upsert_position(user, &updated).await?;
            outcome.completed.push((name.clone(), found.code));
        }
        info!(
            user,
            completed = outcome.completed.len(),
            not_found = outcome.not_found.len(),
            "Completed fund codes"
        );
        Ok(outcome)
    }

    async fn directory_name(&self, code: &FundCode) -> Result<Option<String>> {
        Ok(self.directory.get_profile(code).await?.map(|p| p.name))
    }
}
