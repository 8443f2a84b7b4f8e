//! Terminal rendering and command handlers.

pub mod directory;
pub mod positions;
pub mod settlement;
pub mod setup;
pub mod ui;
