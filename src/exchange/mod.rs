//! Exchange access.
//!
//! ## Binance
//! Signed REST client for USDⓈ-M futures:
//! - plain orders and conditional (algo) orders
//! - order status lookups by client id
//! - leverage, trading rules and 24h tickers
//!
//! ## Mock
//! In-memory paper exchange with trigger simulation and fault injection.

mod client;
pub mod mock;
mod resilient;
mod rules;
mod traits;
mod types;

pub use client::BinanceClient;
pub use mock::MockExchange;
pub use resilient::ResilientExchange;
pub use rules::TradingRulesCache;
pub use traits::ExchangeClient;
pub use types::*;
