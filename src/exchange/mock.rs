//! In-memory exchange for paper trading and tests.
//!
//! Orders are keyed by client id. Market entries fill immediately at the
//! current mark price; conditional legs rest until [`MockExchange::set_mark_price`]
//! crosses their trigger, at which point they report `FINISHED` the way
//! Binance algo orders do.

use super::traits::ExchangeClient;
use super::types::*;
use crate::error::ExchangeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Exchange operations faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Submit,
    SubmitConditional,
    Cancel,
    Query,
    Leverage,
    Rules,
    Snapshot,
}

/// A simulated order resting on (or executed by) the mock exchange.
#[derive(Debug, Clone)]
pub struct MockOrder {
    pub exchange_order_id: String,
    pub client_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
    pub conditional: bool,
    /// Raw exchange status (`NEW`, `FILLED`, `FINISHED`, `CANCELED`, ...)
    pub status: String,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl MockOrder {
    fn is_resting(&self) -> bool {
        matches!(self.status.as_str(), "NEW" | "PARTIALLY_FILLED" | "TRIGGERING")
    }

    /// Whether a conditional order fires at `price`.
    fn triggers_at(&self, price: Decimal) -> bool {
        let Some(trigger) = self.trigger_price else {
            return false;
        };
        match (self.order_type, self.side) {
            // Long exit: take profit above, stop below
            (OrderType::TakeProfitMarket, OrderSide::Sell) => price >= trigger,
            (OrderType::StopMarket, OrderSide::Sell) => price <= trigger,
            // Short exit: mirrored
            (OrderType::TakeProfitMarket, OrderSide::Buy) => price <= trigger,
            (OrderType::StopMarket, OrderSide::Buy) => price >= trigger,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    error: ExchangeError,
    remaining: u32,
    /// Record the order before failing, simulating a lost acknowledgement
    after_accept: bool,
}

#[derive(Debug, Default)]
struct MockState {
    orders: HashMap<String, MockOrder>,
    snapshots: HashMap<String, MarketSnapshot>,
    rules: HashMap<String, TradingRules>,
    leverage: HashMap<String, u8>,
    op_faults: HashMap<MockOp, Fault>,
    client_faults: HashMap<(MockOp, String), Fault>,
    calls: HashMap<(MockOp, String), u32>,
    order_count: u64,
}

impl MockState {
    /// Consume one injected fault for `op` (client-specific first).
    fn take_fault(&mut self, op: MockOp, client_id: &str) -> Option<Fault> {
        let key = (op, client_id.to_string());
        if let Some(fault) = self.client_faults.get_mut(&key) {
            if fault.remaining > 0 {
                fault.remaining = fault.remaining.saturating_sub(1);
                return Some(fault.clone());
            }
        }
        if let Some(fault) = self.op_faults.get_mut(&op) {
            if fault.remaining > 0 {
                fault.remaining = fault.remaining.saturating_sub(1);
                return Some(fault.clone());
            }
        }
        None
    }

    fn count_call(&mut self, op: MockOp, client_id: &str) {
        *self.calls.entry((op, client_id.to_string())).or_insert(0) += 1;
    }

    fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.snapshots.get(symbol).map(|s| s.last_price)
    }
}

/// Mock client that simulates Binance futures responses.
pub struct MockExchange {
    state: RwLock<MockState>,
    order_id_counter: AtomicU64,
    latency: Duration,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState::default()),
            order_id_counter: AtomicU64::new(1),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call by `latency` (exercises timeouts and overlap).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Rules returned when none were configured for a symbol.
    pub fn default_rules(symbol: &str) -> TradingRules {
        TradingRules {
            symbol: symbol.to_string(),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            max_qty: dec!(1000000),
            tick_size: dec!(0.0001),
            min_notional: dec!(5),
        }
    }

    pub async fn set_rules(&self, rules: TradingRules) {
        self.state.write().await.rules.insert(rules.symbol.clone(), rules);
    }

    /// Replace the market view for a symbol and evaluate triggers.
    pub async fn set_snapshot(&self, snapshot: MarketSnapshot) -> Vec<String> {
        let symbol = snapshot.symbol.clone();
        let price = snapshot.last_price;
        self.state.write().await.snapshots.insert(symbol.clone(), snapshot);
        self.evaluate_triggers(&symbol, price).await
    }

    /// Move the mark price. Returns client ids of conditional orders that fired.
    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) -> Vec<String> {
        {
            let mut state = self.state.write().await;
            let snapshot = state
                .snapshots
                .entry(symbol.to_string())
                .or_insert_with(|| MarketSnapshot {
                    symbol: symbol.to_string(),
                    last_price: price,
                    price_change_pct: Decimal::ZERO,
                    high_24h: price,
                    low_24h: price,
                    quote_volume_24h: Decimal::ZERO,
                    observed_at: Utc::now(),
                });
            snapshot.last_price = price;
            snapshot.high_24h = snapshot.high_24h.max(price);
            snapshot.low_24h = snapshot.low_24h.min(price);
            snapshot.observed_at = Utc::now();
        }
        self.evaluate_triggers(symbol, price).await
    }

    async fn evaluate_triggers(&self, symbol: &str, price: Decimal) -> Vec<String> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut fired = Vec::new();

        for order in state.orders.values_mut() {
            if order.symbol == symbol
                && order.conditional
                && order.is_resting()
                && order.triggers_at(price)
            {
                order.status = "FINISHED".to_string();
                order.executed_qty = order.quantity;
                order.avg_price = Some(price);
                order.updated_at = now;
                fired.push(order.client_id.clone());
            }
        }

        for client_id in &fired {
            info!(%symbol, %client_id, %price, "Mock conditional order triggered");
        }
        fired
    }

    /// Force the raw status of an order (e.g. `FINISHED`, `EXPIRED`, `WEIRD`).
    pub async fn set_status(&self, client_id: &str, status: &str) -> bool {
        let mut state = self.state.write().await;
        match state.orders.get_mut(client_id) {
            Some(order) => {
                order.status = status.to_string();
                order.updated_at = Utc::now();
                if status == "FINISHED" || status == "FILLED" {
                    order.executed_qty = order.quantity;
                    if order.avg_price.is_none() {
                        order.avg_price = order.trigger_price;
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Forget an order so that queries and cancels report not-found.
    pub async fn remove_order(&self, client_id: &str) -> Option<MockOrder> {
        self.state.write().await.orders.remove(client_id)
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub async fn fail_next(&self, op: MockOp, error: ExchangeError, times: u32) {
        self.state.write().await.op_faults.insert(
            op,
            Fault {
                error,
                remaining: times,
                after_accept: false,
            },
        );
    }

    /// Fail the next `times` calls of `op` addressing `client_id`.
    pub async fn fail_client(&self, op: MockOp, client_id: &str, error: ExchangeError, times: u32) {
        self.state.write().await.client_faults.insert(
            (op, client_id.to_string()),
            Fault {
                error,
                remaining: times,
                after_accept: false,
            },
        );
    }

    /// Accept the next submission of `op` but report a timeout to the caller.
    pub async fn drop_ack_next(&self, op: MockOp) {
        self.state.write().await.op_faults.insert(
            op,
            Fault {
                error: ExchangeError::Timeout(Duration::from_secs(10)),
                remaining: 1,
                after_accept: true,
            },
        );
    }

    /// Number of calls of `op` that addressed `client_id` (failed ones included).
    pub async fn calls(&self, op: MockOp, client_id: &str) -> u32 {
        self.state
            .read()
            .await
            .calls
            .get(&(op, client_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub async fn cancel_calls(&self, client_id: &str) -> u32 {
        self.calls(MockOp::Cancel, client_id).await
    }

    pub async fn order(&self, client_id: &str) -> Option<MockOrder> {
        self.state.read().await.orders.get(client_id).cloned()
    }

    pub async fn order_count(&self) -> u64 {
        self.state.read().await.order_count
    }

    pub async fn leverage(&self, symbol: &str) -> Option<u8> {
        self.state.read().await.leverage.get(symbol).copied()
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn ack(order: &MockOrder) -> OrderAck {
        OrderAck {
            exchange_order_id: order.exchange_order_id.clone(),
            client_id: order.client_id.clone(),
            status: order.status.clone(),
            executed_qty: order.executed_qty,
            avg_price: order.avg_price,
        }
    }

    /// Shared submission path for plain and conditional orders.
    async fn accept(&self, op: MockOp, mut order: MockOrder) -> Result<OrderAck, ExchangeError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        state.count_call(op, &order.client_id);

        let fault = state.take_fault(op, &order.client_id);
        if let Some(fault) = &fault {
            if !fault.after_accept {
                return Err(fault.error.clone());
            }
        }

        if state.orders.contains_key(&order.client_id) {
            return Err(ExchangeError::Duplicate(order.client_id));
        }

        if !order.conditional && order.order_type == OrderType::Market {
            let price = state.mark_price(&order.symbol);
            order.status = "FILLED".to_string();
            order.executed_qty = order.quantity;
            order.avg_price = price;
        }

        order.exchange_order_id = self.next_order_id().to_string();
        state.order_count += 1;

        info!(
            client_id = %order.client_id,
            symbol = %order.symbol,
            side = ?order.side,
            order_type = order.order_type.as_str(),
            quantity = %order.quantity,
            status = %order.status,
            "Mock order accepted"
        );

        let ack = Self::ack(&order);
        state.orders.insert(order.client_id.clone(), order);

        match fault {
            Some(fault) => Err(fault.error),
            None => Ok(ack),
        }
    }

    /// Apply a generic fault check for calls that do not create orders.
    async fn check(&self, op: MockOp, key: &str) -> Result<(), ExchangeError> {
        self.simulate_latency().await;
        let mut state = self.state.write().await;
        state.count_call(op, key);
        match state.take_fault(op, key) {
            Some(fault) => Err(fault.error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, ExchangeError> {
        self.accept(
            MockOp::Submit,
            MockOrder {
                exchange_order_id: String::new(),
                client_id: order.new_client_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                quantity: order.quantity,
                trigger_price: None,
                reduce_only: order.reduce_only,
                conditional: false,
                status: "NEW".to_string(),
                executed_qty: Decimal::ZERO,
                avg_price: None,
                updated_at: Utc::now(),
            },
        )
        .await
    }

    async fn submit_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> Result<OrderAck, ExchangeError> {
        self.accept(
            MockOp::SubmitConditional,
            MockOrder {
                exchange_order_id: String::new(),
                client_id: order.client_algo_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                quantity: order.quantity,
                trigger_price: Some(order.trigger_price),
                reduce_only: order.reduce_only,
                conditional: true,
                status: "NEW".to_string(),
                executed_qty: Decimal::ZERO,
                avg_price: None,
                updated_at: Utc::now(),
            },
        )
        .await
    }

    async fn cancel_order(&self, leg: &LegRef) -> Result<(), ExchangeError> {
        self.check(MockOp::Cancel, &leg.client_id).await?;

        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&leg.client_id)
            .ok_or_else(|| ExchangeError::NotFound(leg.client_id.clone()))?;

        if !order.is_resting() {
            // Binance answers -2011 for orders that are no longer open
            return Err(ExchangeError::NotFound(format!(
                "{} is {}",
                leg.client_id, order.status
            )));
        }

        order.status = "CANCELED".to_string();
        order.updated_at = Utc::now();
        debug!(client_id = %leg.client_id, "Mock order cancelled");
        Ok(())
    }

    async fn query_status(&self, leg: &LegRef) -> Result<OrderStatusReport, ExchangeError> {
        self.check(MockOp::Query, &leg.client_id).await?;

        let state = self.state.read().await;
        let order = state
            .orders
            .get(&leg.client_id)
            .ok_or_else(|| ExchangeError::NotFound(leg.client_id.clone()))?;

        Ok(OrderStatusReport {
            client_id: order.client_id.clone(),
            exchange_order_id: Some(order.exchange_order_id.clone()),
            status: order.status.clone(),
            executed_qty: Some(order.executed_qty),
            avg_price: order.avg_price,
            updated_at: Some(order.updated_at),
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError> {
        self.check(MockOp::Leverage, symbol).await?;
        self.state
            .write()
            .await
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn trading_rules(&self, symbol: &str) -> Result<TradingRules, ExchangeError> {
        self.check(MockOp::Rules, symbol).await?;
        let state = self.state.read().await;
        Ok(state
            .rules
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Self::default_rules(symbol)))
    }

    async fn market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        self.check(MockOp::Snapshot, symbol).await?;
        self.state
            .read()
            .await
            .snapshots
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("no market data for {}", symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_buy(client_id: &str, quantity: Decimal) -> NewOrder {
        NewOrder {
            symbol: "XYZUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            reduce_only: false,
            new_client_order_id: client_id.to_string(),
        }
    }

    fn exit_leg(client_id: &str, order_type: OrderType, trigger: Decimal) -> ConditionalOrder {
        ConditionalOrder {
            symbol: "XYZUSDT".to_string(),
            side: OrderSide::Sell,
            order_type,
            trigger_price: trigger,
            quantity: dec!(100),
            reduce_only: true,
            client_algo_id: client_id.to_string(),
        }
    }

    fn leg(client_id: &str, conditional: bool) -> LegRef {
        LegRef {
            symbol: "XYZUSDT".to_string(),
            client_id: client_id.to_string(),
            conditional,
        }
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let exchange = MockExchange::new();
        exchange.set_mark_price("XYZUSDT", dec!(0.5)).await;

        let ack = exchange.submit_order(&market_buy("e-1", dec!(100))).await.unwrap();

        assert_eq!(ack.status, "FILLED");
        assert_eq!(ack.executed_qty, dec!(100));
        assert_eq!(ack.avg_price, Some(dec!(0.5)));
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_long_exit_triggers() {
        let exchange = MockExchange::new();
        exchange.set_mark_price("XYZUSDT", dec!(0.5)).await;
        exchange
            .submit_conditional_order(&exit_leg("tp-1", OrderType::TakeProfitMarket, dec!(0.55)))
            .await
            .unwrap();
        exchange
            .submit_conditional_order(&exit_leg("sl-1", OrderType::StopMarket, dec!(0.45)))
            .await
            .unwrap();

        assert!(exchange.set_mark_price("XYZUSDT", dec!(0.52)).await.is_empty());

        let fired = exchange.set_mark_price("XYZUSDT", dec!(0.56)).await;
        assert_eq!(fired, vec!["tp-1".to_string()]);

        let tp = exchange.query_status(&leg("tp-1", true)).await.unwrap();
        assert_eq!(tp.status, "FINISHED");
        let sl = exchange.query_status(&leg("sl-1", true)).await.unwrap();
        assert_eq!(sl.status, "NEW");
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let exchange = MockExchange::new();
        exchange.submit_order(&market_buy("e-1", dec!(1))).await.unwrap();
        let err = exchange.submit_order(&market_buy("e-1", dec!(1))).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_cancel_finished_order_is_not_found() {
        let exchange = MockExchange::new();
        exchange
            .submit_conditional_order(&exit_leg("tp-1", OrderType::TakeProfitMarket, dec!(0.55)))
            .await
            .unwrap();
        exchange.set_status("tp-1", "FINISHED").await;

        let err = exchange.cancel_order(&leg("tp-1", true)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound(_)));

        let missing = exchange.cancel_order(&leg("nope", true)).await.unwrap_err();
        assert!(matches!(missing, ExchangeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_client_faults_are_counted_and_consumed() {
        let exchange = MockExchange::new();
        exchange
            .submit_conditional_order(&exit_leg("sl-1", OrderType::StopMarket, dec!(0.45)))
            .await
            .unwrap();
        exchange
            .fail_client(
                MockOp::Cancel,
                "sl-1",
                ExchangeError::Transport("connection reset".into()),
                2,
            )
            .await;

        assert!(exchange.cancel_order(&leg("sl-1", true)).await.is_err());
        assert!(exchange.cancel_order(&leg("sl-1", true)).await.is_err());
        exchange.cancel_order(&leg("sl-1", true)).await.unwrap();

        assert_eq!(exchange.cancel_calls("sl-1").await, 3);
        assert_eq!(exchange.order("sl-1").await.unwrap().status, "CANCELED");
    }

    #[tokio::test]
    async fn test_dropped_ack_still_records_order() {
        let exchange = MockExchange::new();
        exchange.drop_ack_next(MockOp::Submit).await;

        let err = exchange.submit_order(&market_buy("e-1", dec!(1))).await.unwrap_err();
        assert!(err.is_transient());
        assert!(exchange.order("e-1").await.is_some());
    }
}
