//! Ledger and fund directory persistence.

pub mod disk;
pub mod memory;

use crate::core::config::AppConfig;
use crate::core::fund::{FundDirectory, FundDirectoryWriter};
use crate::core::ledger::LedgerStore;
use anyhow::Result;
use disk::DiskStore;
use std::sync::Arc;

/// Everything the application needs from one storage backend.
pub trait Store: LedgerStore + FundDirectory + FundDirectoryWriter {}

impl<T: LedgerStore + FundDirectory + FundDirectoryWriter> Store for T {}

/// Opens the persistent store under the configured data path.
pub fn open(config: &AppConfig) -> Result<Arc<DiskStore>> {
    let path = config.default_data_path()?;
    Ok(Arc::new(DiskStore::open(&path)?))
}
