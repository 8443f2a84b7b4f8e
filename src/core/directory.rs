//! Populates the fund directory from a remote source.

use crate::core::fund::{FundCode, FundDirectory, FundDirectorySource, FundDirectoryWriter, FundProfile};
use anyhow::{Result, bail};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Profiles fetched at once by [`DirectoryMaintainer::ingest_profiles`].
pub const INGEST_CONCURRENCY: usize = 4;

pub struct DirectoryMaintainer {
    source: Arc<dyn FundDirectorySource>,
    directory: Arc<dyn FundDirectory>,
    writer: Arc<dyn FundDirectoryWriter>,
}

impl DirectoryMaintainer {
    pub fn new(
        source: Arc<dyn FundDirectorySource>,
        directory: Arc<dyn FundDirectory>,
        writer: Arc<dyn FundDirectoryWriter>,
    ) -> Self {
        Self {
            source,
            directory,
            writer,
        }
    }

    /// Writes `(code, name, type)` for the listed funds after skipping
    /// `offset` and keeping at most `limit` of them. Returns the count written.
    pub async fn sync_directory(&self, limit: Option<usize>, offset: usize) -> Result<usize> {
        let Some(listed) = self.source.fetch_fund_codes().await else {
            bail!("Fund code list is unavailable");
        };
        let total = listed.len();
        let mut written = 0;
        for profile in listed
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
        {
            let merged = match self.directory.get_profile(&profile.code).await? {
                Some(existing) => FundProfile {
                    company: existing.company,
                    managers: existing.managers,
                    ..profile
                },
                None => profile,
            };
            self.writer.upsert_profile(&merged).await?;
            written += 1;
        }
        info!(total, offset, written, "Synced fund directory");
        Ok(written)
    }

    /// Fetches full profiles for `codes`, a few at a time, and writes the
    /// ones that were available. Returns the count written.
    pub async fn ingest_profiles(&self, codes: &[FundCode]) -> Result<usize> {
        let fetched: Vec<(FundCode, Option<FundProfile>)> = stream::iter(codes.iter().cloned())
            .map(|code| {
                let source = Arc::clone(&self.source);
                async move {
                    let profile = source.fetch_profile(&code).await;
                    (code, profile)
                }
            })
            .buffer_unordered(INGEST_CONCURRENCY)
            .collect()
            .await;

        let mut written = 0;
        for (code, profile) in fetched {
            match profile {
                Some(profile) => {
                    self.writer.upsert_profile(&profile).await?;
                    written += 1;
                }
                None => debug!(code = %code, "No profile available"),
            }
        }
        info!(requested = codes.len(), written, "Ingested fund profiles");
        Ok(written)
    }

    pub async fn fund_profile(&self, code: &FundCode) -> Result<Option<FundProfile>> {
        self.directory.get_profile(code).await
    }
}
