//! Core business logic abstractions

pub mod cache;
pub mod config;
pub mod directory;
pub mod fund;
pub mod ledger;
pub mod log;
pub mod market;
pub mod positions;
pub mod resolver;
pub mod schedule;
pub mod settlement;

// Re-export main types for cleaner imports
pub use fund::{FundCode, FundDirectory, FundId, FundProfile};
pub use ledger::{LedgerStore, PositionRecord, UserId};
pub use market::MarketDataProvider;
pub use settlement::SettlementEngine;
