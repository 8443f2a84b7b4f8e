pub mod cli;
pub mod core;
pub mod providers;
pub mod store;

pub use crate::core::config;

use crate::core::config::AppConfig;
use crate::core::directory::DirectoryMaintainer;
use crate::core::fund::{FundCode, FundDirectorySource, FundId};
use crate::core::ledger::UserId;
use crate::core::market::MarketDataProvider;
use crate::core::positions::{NewPosition, PositionLedger, PositionUpdate};
use crate::core::resolver::Resolver;
use crate::core::schedule::SlotTable;
use crate::core::settlement::SettlementEngine;
use crate::providers::eastmoney::EastMoneyProvider;
use crate::store::Store;
use anyhow::Result;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub enum AppCommand {
    Serve,
    Settle {
        rollup: bool,
    },
    Status,
    Snapshots {
        user: UserId,
        date: Option<NaiveDate>,
    },
    Recompute {
        user: UserId,
        date: Option<NaiveDate>,
    },
    Resolve {
        name: String,
    },
    Positions {
        user: UserId,
    },
    Add {
        user: UserId,
        position: NewPosition,
    },
    Update {
        user: UserId,
        id: FundId,
        update: PositionUpdate,
    },
    Remove {
        user: UserId,
        ids: Vec<FundId>,
    },
    CompleteCodes {
        user: UserId,
    },
    SyncDirectory {
        limit: Option<usize>,
        offset: usize,
    },
    Ingest {
        codes: Vec<FundCode>,
    },
}

/// Services wired over one store and one market data provider.
pub struct App {
    pub config: AppConfig,
    pub engine: Arc<SettlementEngine>,
    pub ledger: PositionLedger,
    pub resolver: Arc<Resolver>,
    pub directory: DirectoryMaintainer,
}

impl App {
    /// Opens the persistent store and the EastMoney provider from `config`.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let store = store::open(&config)?;
        let provider = Arc::new(EastMoneyProvider::new(&config.providers.eastmoney)?);
        Self::with_parts(config, store, provider).await
    }

    pub async fn with_parts<S, P>(config: AppConfig, store: Arc<S>, provider: Arc<P>) -> Result<Self>
    where
        S: Store + 'static,
        P: MarketDataProvider + FundDirectorySource + 'static,
    {
        let resolver = Arc::new(Resolver::new(
            store.clone(),
            Duration::from_secs(config.resolver.directory_ttl_secs),
        ));
        let engine = Arc::new(SettlementEngine::new(
            store.clone(),
            store.clone(),
            provider.clone(),
            SlotTable::standard(),
        ));
        engine.restore_status().await?;
        let ledger = PositionLedger::new(store.clone(), store.clone(), Arc::clone(&resolver));
        let directory = DirectoryMaintainer::new(provider, store.clone(), store);

        Ok(Self {
            config,
            engine,
            ledger,
            resolver,
            directory,
        })
    }

    pub async fn run(&self, command: AppCommand) -> Result<()> {
        match command {
            AppCommand::Serve => cli::settlement::serve(self).await,
            AppCommand::Settle { rollup } => cli::settlement::settle(self, rollup).await,
            AppCommand::Status => cli::settlement::status(self).await,
            AppCommand::Snapshots { user, date } => {
                cli::settlement::snapshots(self, user, date).await
            }
            AppCommand::Recompute { user, date } => {
                cli::settlement::recompute(self, user, date).await
            }
            AppCommand::Resolve { name } => cli::directory::resolve(self, &name).await,
            AppCommand::Positions { user } => cli::positions::list(self, user).await,
            AppCommand::Add { user, position } => cli::positions::add(self, user, position).await,
            AppCommand::Update { user, id, update } => {
                cli::positions::update(self, user, &id, update).await
            }
            AppCommand::Remove { user, ids } => cli::positions::remove(self, user, &ids).await,
            AppCommand::CompleteCodes { user } => cli::positions::complete_codes(self, user).await,
            AppCommand::SyncDirectory { limit, offset } => {
                cli::directory::sync(self, limit, offset).await
            }
            AppCommand::Ingest { codes } => cli::directory::ingest(self, &codes).await,
        }
    }
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("fundwatch starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None if AppConfig::default_config_path()?.exists() => AppConfig::load()?,
        None => {
            debug!("No config file found, using defaults");
            AppConfig::default()
        }
    };
    debug!("Loaded config: {config:#?}");

    let app = App::open(config).await?;
    app.run(command).await
}
