//! Type definitions for exchange requests/responses and their
//! venue-neutral counterparts consumed by the core.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ==================== Venue-neutral types ====================

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// New (immediately routed) order request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub new_client_order_id: String,
}

/// Conditional ("algo") order request: activates when the trigger price is hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalOrder {
    pub symbol: String,
    pub side: OrderSide,
    /// `TakeProfitMarket` or `StopMarket`
    pub order_type: OrderType,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub reduce_only: bool,
    pub client_algo_id: String,
}

/// Exchange acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_id: String,
    /// Raw exchange status string, normalized later by the reconciler
    pub status: String,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusReport {
    pub client_id: String,
    pub exchange_order_id: Option<String>,
    pub status: String,
    pub executed_qty: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Addresses one order on the exchange by its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LegRef {
    pub symbol: String,
    pub client_id: String,
    /// Conditional orders are addressed through the algo endpoints
    pub conditional: bool,
}

/// Exchange trading constraints for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingRules {
    pub symbol: String,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

/// Point-in-time market view handed to decision providers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: Decimal,
    /// 24h change in percent (e.g. 3.5 = +3.5%)
    pub price_change_pct: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub quote_volume_24h: Decimal,
    pub observed_at: DateTime<Utc>,
}

// ==================== Binance wire types ====================

/// Binance error body: `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Order response from `/fapi/v1/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub client_order_id: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub avg_price: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub update_time: Option<i64>,
}

/// Algo order response from `/fapi/v1/algoOrder` (submit and query).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgoOrderResponse {
    pub algo_id: i64,
    pub client_algo_id: String,
    pub algo_status: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub quantity: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub actual_price: Option<Decimal>,
    #[serde(default)]
    pub update_time: Option<i64>,
}

/// Exchange information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesExchangeInfo {
    pub symbols: Vec<FuturesSymbolInfo>,
}

/// Symbol information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesSymbolInfo {
    pub symbol: String,
    pub status: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// Subset of Binance symbol filters the sizing logic depends on.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter {
        #[serde(with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
    },
    #[serde(rename = "MARKET_LOT_SIZE", rename_all = "camelCase")]
    MarketLotSize {
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        notional: Decimal,
    },
    #[serde(other)]
    Other,
}

impl FuturesSymbolInfo {
    /// Collapse the filter list into [`TradingRules`].
    ///
    /// Market orders are bounded by the tighter of LOT_SIZE and
    /// MARKET_LOT_SIZE maxima.
    pub fn trading_rules(&self) -> Option<TradingRules> {
        let mut step_size = None;
        let mut min_qty = Decimal::ZERO;
        let mut max_qty = None;
        let mut market_max_qty = None;
        let mut tick_size = None;
        let mut min_notional = Decimal::ZERO;

        for filter in &self.filters {
            match filter {
                SymbolFilter::PriceFilter { tick_size: t } => tick_size = Some(*t),
                SymbolFilter::LotSize {
                    step_size: s,
                    min_qty: min,
                    max_qty: max,
                } => {
                    step_size = Some(*s);
                    min_qty = *min;
                    max_qty = Some(*max);
                }
                SymbolFilter::MarketLotSize { max_qty: max } => market_max_qty = Some(*max),
                SymbolFilter::MinNotional { notional } => min_notional = *notional,
                SymbolFilter::Other => {}
            }
        }

        let max_qty = match (max_qty, market_max_qty) {
            (Some(a), Some(b)) if b > Decimal::ZERO => a.min(b),
            (Some(a), _) => a,
            (None, b) => b?,
        };

        Some(TradingRules {
            symbol: self.symbol.clone(),
            step_size: step_size?,
            min_qty,
            max_qty,
            tick_size: tick_size?,
            min_notional,
        })
    }
}

/// 24-hour ticker statistics.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_change_percent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub high_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub low_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_volume: Decimal,
    pub close_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_filters_collapse_into_rules() {
        let json = r#"{
            "symbol": "XYZUSDT",
            "status": "TRADING",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.0010", "minPrice": "0.001", "maxPrice": "1000"},
                {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "1000000"},
                {"filterType": "MARKET_LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "50000"},
                {"filterType": "MIN_NOTIONAL", "notional": "5"},
                {"filterType": "PERCENT_PRICE", "multiplierUp": "1.05"}
            ]
        }"#;

        let info: FuturesSymbolInfo = serde_json::from_str(json).unwrap();
        let rules = info.trading_rules().unwrap();

        assert_eq!(rules.step_size, dec!(1));
        assert_eq!(rules.tick_size, dec!(0.001));
        assert_eq!(rules.max_qty, dec!(50000));
        assert_eq!(rules.min_notional, dec!(5));
    }

    #[test]
    fn test_rules_require_lot_and_price_filters() {
        let info = FuturesSymbolInfo {
            symbol: "ABCUSDT".to_string(),
            status: "TRADING".to_string(),
            filters: vec![SymbolFilter::MinNotional { notional: dec!(5) }],
        };
        assert!(info.trading_rules().is_none());
    }

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::parse("SELL"), Some(OrderSide::Sell));
        assert_eq!(OrderType::TakeProfitMarket.as_str(), "TAKE_PROFIT_MARKET");
    }
}
