//! Venue-agnostic exchange interface consumed by the core.
//!
//! The pipeline, reconciler and closure handler only ever talk to
//! `dyn ExchangeClient`, which lets the same code run against:
//! - Binance USDⓈ-M futures (`BinanceClient`)
//! - the in-memory paper exchange (`MockExchange`)
//! - either of the above behind `ResilientExchange` (timeouts + retries)

use async_trait::async_trait;

use crate::error::ExchangeError;

use super::types::{
    ConditionalOrder, LegRef, MarketSnapshot, NewOrder, OrderAck, OrderStatusReport,
    TradingRules,
};

/// Order routing and status lookups against a remote exchange.
///
/// Implementations must be safe to call concurrently; every call is I/O
/// bound and may fail with a transient [`ExchangeError`].
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an immediately routed order (market/limit).
    async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, ExchangeError>;

    /// Submit a conditional (take-profit / stop-loss) order.
    async fn submit_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> Result<OrderAck, ExchangeError>;

    /// Cancel an order by correlation id.
    async fn cancel_order(&self, leg: &LegRef) -> Result<(), ExchangeError>;

    /// Current status of an order by correlation id. The status string is
    /// returned verbatim; normalization is the caller's job.
    async fn query_status(&self, leg: &LegRef) -> Result<OrderStatusReport, ExchangeError>;

    /// Set leverage for a symbol before entering.
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError>;

    /// Step size, tick size and minimum notional for a symbol.
    async fn trading_rules(&self, symbol: &str) -> Result<TradingRules, ExchangeError>;

    /// Latest market view for decision providers.
    async fn market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError>;
}
