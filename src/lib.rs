pub mod cli;
pub mod config;
pub mod data_paths;
pub use data_paths as data;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod market_data;
pub mod queue;
pub mod rate_limit;
pub mod rest;
pub mod store;
pub mod sync;
pub mod types;
pub mod ws;

// Re-export the engine entry points at the root level
pub use errors::SyncError;
pub use sync::{EngineEvent, SyncEngine};
