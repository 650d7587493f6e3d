//! # Bracket Keeper
//!
//! Scheduled strategy evaluation and bracket order lifecycle management
//! on Binance Futures.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Exchange trait, Binance REST client, paper exchange, retry wrapper
//! - `strategy`: Scheduler, decision providers and the submission pipeline
//! - `bracket`: Order/bracket data model and the closure handler
//! - `reconcile`: Status normalization and the reconciliation loop
//! - `persistence`: SQLite store
//! - `utils`: Retry/backoff, service lifecycle, decimal helpers

pub mod bracket;
pub mod config;
pub mod error;
pub mod exchange;
pub mod keeper;
pub mod persistence;
pub mod reconcile;
pub mod strategy;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, ExchangeError, Result};
pub use keeper::{BracketKeeper, KeeperHandles};
