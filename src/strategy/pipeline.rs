//! Order submission: decision → sized entry → TP/SL legs → one store
//! transaction.

use super::decision::Decision;
use super::model::{RiskSettings, Strategy};
use crate::bracket::{
    BracketDraft, BracketLink, BracketOrders, BracketStatus, OrderKind, OrderStatus,
    ScheduledOrder,
};
use crate::error::{Error, ExchangeError, Result};
use crate::exchange::{
    ConditionalOrder, ExchangeClient, NewOrder, OrderAck, OrderSide, OrderType, ResilientExchange,
    TradingRules, TradingRulesCache,
};
use crate::persistence::Store;
use crate::reconcile::{normalize_status, DiscrepancyQueue, PendingWrite};
use crate::utils::decimal::{round_down_to_lot, round_to_tick, round_up_to_lot};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the pipeline placed on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Entry with TP and SL legs
    Bracket {
        link: BracketLink,
        /// False when the store write failed and the draft was queued
        persisted: bool,
    },
    /// Plain entry, no protection configured
    Entry {
        order: ScheduledOrder,
        persisted: bool,
    },
}

impl Submission {
    /// Group id for brackets, client id for plain entries.
    pub fn id(&self) -> &str {
        match self {
            Submission::Bracket { link, .. } => &link.group_id,
            Submission::Entry { order, .. } => &order.client_order_id,
        }
    }

    pub fn persisted(&self) -> bool {
        match self {
            Submission::Bracket { persisted, .. } | Submission::Entry { persisted, .. } => {
                *persisted
            }
        }
    }
}

/// Take-profit and stop-loss distances in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Protection {
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
}

impl Protection {
    fn from_risk(risk: &RiskSettings, side: OrderSide) -> Result<Option<Self>> {
        let protection = match (risk.take_profit_pct, risk.stop_loss_pct) {
            (None, None) => return Ok(None),
            (Some(take_profit_pct), Some(stop_loss_pct)) => Protection {
                take_profit_pct,
                stop_loss_pct,
            },
            _ => {
                return Err(Error::Validation(
                    "take_profit_pct and stop_loss_pct must be configured together".to_string(),
                ))
            }
        };

        if protection.take_profit_pct <= Decimal::ZERO || protection.stop_loss_pct <= Decimal::ZERO
        {
            return Err(Error::Validation(
                "take-profit and stop-loss distances must be positive".to_string(),
            ));
        }

        // The leg below the entry price must stay above zero
        let below = match side {
            OrderSide::Buy => protection.stop_loss_pct,
            OrderSide::Sell => protection.take_profit_pct,
        };
        if below >= dec!(100) {
            return Err(Error::Validation(format!(
                "a {}% distance below entry yields a non-positive trigger price",
                below
            )));
        }

        Ok(Some(protection))
    }

    /// `(take_profit, stop_loss)` trigger prices around `entry_price`.
    fn trigger_prices(&self, side: OrderSide, entry_price: Decimal, tick: Decimal) -> (Decimal, Decimal) {
        let tp = self.take_profit_pct / dec!(100);
        let sl = self.stop_loss_pct / dec!(100);
        let (tp_price, sl_price) = match side {
            OrderSide::Buy => (entry_price * (Decimal::ONE + tp), entry_price * (Decimal::ONE - sl)),
            OrderSide::Sell => (entry_price * (Decimal::ONE - tp), entry_price * (Decimal::ONE + sl)),
        };
        (round_to_tick(tp_price, tick), round_to_tick(sl_price, tick))
    }
}

/// Entry quantity for `notional × multiplier` at `price`, fitted to the
/// exchange's step size, minimum quantity and minimum notional.
///
/// Below-minimum sizes are raised to the smallest valid quantity, never
/// dropped. Sizes above the exchange maximum are rejected.
pub fn size_entry(
    rules: &TradingRules,
    notional: Decimal,
    size_multiplier: Decimal,
    price: Decimal,
) -> Result<Decimal> {
    if price <= Decimal::ZERO {
        return Err(Error::Validation(format!("price must be positive, got {}", price)));
    }
    if size_multiplier <= Decimal::ZERO {
        return Err(Error::Validation(format!(
            "size multiplier must be positive, got {}",
            size_multiplier
        )));
    }
    if notional <= Decimal::ZERO {
        return Err(Error::Validation(format!(
            "order notional must be positive, got {}",
            notional
        )));
    }

    let mut quantity = round_down_to_lot(notional * size_multiplier / price, rules.step_size);

    if quantity < rules.min_qty {
        quantity = round_up_to_lot(rules.min_qty, rules.step_size);
    }
    if quantity * price < rules.min_notional {
        quantity = round_up_to_lot(rules.min_notional / price, rules.step_size);
    }

    if quantity > rules.max_qty {
        return Err(Error::Validation(format!(
            "quantity {} exceeds exchange maximum {} for {}",
            quantity, rules.max_qty, rules.symbol
        )));
    }
    if quantity <= Decimal::ZERO {
        return Err(Error::Validation(format!("computed quantity {} for {}", quantity, rules.symbol)));
    }

    Ok(quantity)
}

fn new_group_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("bk-{}", &id[..12])
}

pub struct SubmissionPipeline {
    store: Store,
    exchange: ResilientExchange,
    rules: Arc<TradingRulesCache>,
    discrepancies: Arc<DiscrepancyQueue>,
}

impl SubmissionPipeline {
    pub fn new(
        store: Store,
        exchange: ResilientExchange,
        rules: Arc<TradingRulesCache>,
        discrepancies: Arc<DiscrepancyQueue>,
    ) -> Self {
        Self {
            store,
            exchange,
            rules,
            discrepancies,
        }
    }

    /// Place an entry (plus TP/SL when configured) for a non-no-op decision.
    pub async fn submit(
        &self,
        strategy: &Strategy,
        symbol: &str,
        decision: &Decision,
        price: Decimal,
    ) -> Result<Submission> {
        let side = decision.action.side().ok_or_else(|| {
            Error::Validation("no-op decisions are not submitted".to_string())
        })?;
        let risk = &strategy.risk;
        let protection = Protection::from_risk(risk, side)?;

        let rules = self.rules.get(symbol).await?;
        let quantity = size_entry(&rules, risk.order_notional, decision.size_multiplier, price)?;
        self.check_position_limit(symbol, side, quantity, risk).await?;

        let group_id = new_group_id();
        let entry_client_id = format!("{}-e", group_id);

        info!(
            strategy_id = %strategy.id,
            %symbol,
            ?side,
            %quantity,
            %price,
            reason = %decision.reason,
            client_id = %entry_client_id,
            "Submitting entry"
        );

        self.exchange.set_leverage(symbol, risk.leverage).await?;

        let ack = self
            .exchange
            .submit_order(&NewOrder {
                symbol: symbol.to_string(),
                side,
                order_type: OrderType::Market,
                quantity,
                price: None,
                time_in_force: None,
                reduce_only: false,
                new_client_order_id: entry_client_id.clone(),
            })
            .await
            .map_err(|e| {
                error!(
                    strategy_id = %strategy.id,
                    %symbol,
                    client_id = %entry_client_id,
                    error = %e,
                    "Entry submission failed"
                );
                Error::from(e)
            })?;

        let mut entry = ScheduledOrder {
            id: None,
            strategy_id: strategy.id.clone(),
            group_id: None,
            symbol: symbol.to_string(),
            side,
            kind: OrderKind::Market,
            quantity,
            price: None,
            client_order_id: entry_client_id,
            exchange_order_id: None,
            status: OrderStatus::Pending,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            parent_order_id: None,
            trigger_time: None,
            created_at: Utc::now(),
        };
        apply_ack(&mut entry, &ack);

        let Some(protection) = protection else {
            let persisted = match self.store.insert_order(&entry).await {
                Ok(_) => true,
                Err(e) => {
                    error!(client_id = %entry.client_order_id, error = %e, "Failed to persist entry");
                    self.discrepancies.push(PendingWrite::Order(entry.clone()));
                    false
                }
            };
            return Ok(Submission::Entry {
                order: entry,
                persisted,
            });
        };

        entry.group_id = Some(group_id.clone());
        let entry_price = entry.avg_price.filter(|p| *p > Decimal::ZERO).unwrap_or(price);
        let leg_qty = if entry.executed_qty > Decimal::ZERO {
            entry.executed_qty
        } else {
            quantity
        };
        let (tp_price, sl_price) = protection.trigger_prices(side, entry_price, rules.tick_size);

        let leg = |suffix: &str, kind: OrderKind, trigger: Decimal| ScheduledOrder {
            id: None,
            strategy_id: strategy.id.clone(),
            group_id: Some(group_id.clone()),
            symbol: symbol.to_string(),
            side: side.opposite(),
            kind,
            quantity: leg_qty,
            price: Some(trigger),
            client_order_id: format!("{}-{}", group_id, suffix),
            exchange_order_id: None,
            status: OrderStatus::Pending,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            parent_order_id: None,
            trigger_time: None,
            created_at: Utc::now(),
        };
        let mut orders = BracketOrders {
            take_profit: leg("tp", OrderKind::TakeProfit, tp_price),
            stop_loss: leg("sl", OrderKind::StopLoss, sl_price),
            entry,
        };
        let mut link = BracketLink {
            group_id: group_id.clone(),
            strategy_id: strategy.id.clone(),
            symbol: symbol.to_string(),
            entry_client_id: orders.entry.client_order_id.clone(),
            tp_client_id: orders.take_profit.client_order_id.clone(),
            sl_client_id: orders.stop_loss.client_order_id.clone(),
            status: BracketStatus::Active,
            closed_leg: None,
            close_reason: None,
            sibling_cancel_error: None,
            created_at: Utc::now(),
            closed_at: None,
        };

        let legs_result = self.place_legs(&mut orders).await;

        if let Err(leg_error) = legs_result {
            error!(
                strategy_id = %strategy.id,
                %symbol,
                %group_id,
                entry_client_id = %link.entry_client_id,
                error = %leg_error,
                "Protective leg failed, entry unprotected; manual attention required"
            );
            link.status = BracketStatus::Orphaned;
            link.close_reason = Some(format!("protection failed: {}", leg_error));
            link.closed_at = Some(Utc::now());
            self.persist(BracketDraft { link, orders }).await;
            return Err(leg_error.into());
        }

        info!(
            strategy_id = %strategy.id,
            %symbol,
            %group_id,
            entry_price = %entry_price,
            %tp_price,
            %sl_price,
            quantity = %leg_qty,
            "Bracket placed"
        );

        let persisted = self
            .persist(BracketDraft {
                link: link.clone(),
                orders,
            })
            .await;
        Ok(Submission::Bracket { link, persisted })
    }

    /// Submit TP then SL. If SL fails, the accepted TP is cancelled
    /// best-effort; failed legs are marked `failed` in `orders`.
    async fn place_legs(&self, orders: &mut BracketOrders) -> std::result::Result<(), ExchangeError> {
        if let Err(e) = self.place_leg(&mut orders.take_profit).await {
            orders.take_profit.status = OrderStatus::Failed;
            orders.stop_loss.status = OrderStatus::Failed;
            return Err(e);
        }

        if let Err(e) = self.place_leg(&mut orders.stop_loss).await {
            orders.stop_loss.status = OrderStatus::Failed;
            match self.exchange.cancel_order(&orders.take_profit.leg_ref()).await {
                Ok(()) => orders.take_profit.status = OrderStatus::Cancelled,
                Err(cancel_error) => warn!(
                    client_id = %orders.take_profit.client_order_id,
                    error = %cancel_error,
                    "Failed to cancel take-profit of unprotected entry"
                ),
            }
            return Err(e);
        }

        Ok(())
    }

    async fn place_leg(&self, order: &mut ScheduledOrder) -> std::result::Result<(), ExchangeError> {
        let order_type = match order.kind {
            OrderKind::TakeProfit => OrderType::TakeProfitMarket,
            _ => OrderType::StopMarket,
        };
        let trigger_price = order.price.unwrap_or(Decimal::ZERO);

        let ack = self
            .exchange
            .submit_conditional_order(&ConditionalOrder {
                symbol: order.symbol.clone(),
                side: order.side,
                order_type,
                trigger_price,
                quantity: order.quantity,
                reduce_only: true,
                client_algo_id: order.client_order_id.clone(),
            })
            .await?;
        apply_ack(order, &ack);
        Ok(())
    }

    /// Insert the bracket, or queue it for the reconciler if the store
    /// refuses. Never re-submits anything to the exchange.
    async fn persist(&self, draft: BracketDraft) -> bool {
        match self.store.create_bracket(&draft).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    group_id = %draft.link.group_id,
                    symbol = %draft.link.symbol,
                    error = %e,
                    "Failed to persist accepted bracket"
                );
                self.discrepancies.push(PendingWrite::Bracket(draft));
                false
            }
        }
    }

    async fn check_position_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        risk: &RiskSettings,
    ) -> Result<()> {
        let Some(max_qty) = risk.max_position_qty else {
            return Ok(());
        };

        let position = self.store.net_position(symbol).await?;
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let projected = (position.net_qty + signed).abs();

        if projected > max_qty {
            return Err(Error::Validation(format!(
                "projected position {} in {} exceeds limit {}",
                projected, symbol, max_qty
            )));
        }
        Ok(())
    }
}

/// Copy the exchange's view of a just-submitted order into its row.
fn apply_ack(order: &mut ScheduledOrder, ack: &OrderAck) {
    let status = normalize_status(&ack.status)
        .order_status()
        .unwrap_or(OrderStatus::Submitted);
    if order.status.can_transition_to(status) {
        order.status = status;
    }
    order.exchange_order_id = Some(ack.exchange_order_id.clone());
    order.executed_qty = ack.executed_qty;
    order.avg_price = ack.avg_price;
    if status == OrderStatus::Filled {
        order.trigger_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockOp};
    use crate::strategy::decision::Action;
    use crate::utils::RetryPolicy;
    use std::time::Duration;

    fn rules() -> TradingRules {
        TradingRules {
            symbol: "XYZUSDT".to_string(),
            step_size: dec!(1),
            min_qty: dec!(1),
            max_qty: dec!(10000),
            tick_size: dec!(0.0001),
            min_notional: dec!(5),
        }
    }

    fn strategy(tp: Option<Decimal>, sl: Option<Decimal>) -> Strategy {
        Strategy {
            id: "s-1".to_string(),
            kind: "momentum".to_string(),
            symbols: vec!["XYZUSDT".to_string()],
            params: serde_json::json!({}),
            enabled: true,
            interval_secs: 60,
            risk: RiskSettings {
                leverage: 3,
                order_notional: dec!(50),
                take_profit_pct: tp,
                stop_loss_pct: sl,
                max_position_qty: None,
            },
            last_run_at: None,
        }
    }

    fn buy() -> Decision {
        Decision {
            action: Action::Buy,
            reason: "test".to_string(),
            size_multiplier: Decimal::ONE,
        }
    }

    struct Harness {
        store: Store,
        mock: Arc<MockExchange>,
        discrepancies: Arc<DiscrepancyQueue>,
        pipeline: SubmissionPipeline,
    }

    async fn harness() -> Harness {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        mock.set_rules(rules()).await;
        mock.set_mark_price("XYZUSDT", dec!(0.5)).await;
        let exchange = ResilientExchange::new(
            mock.clone(),
            RetryPolicy::immediate(3),
            Duration::from_secs(1),
        );
        let rules = Arc::new(TradingRulesCache::new(mock.clone(), Duration::from_secs(60)));
        let discrepancies = Arc::new(DiscrepancyQueue::new());
        let pipeline =
            SubmissionPipeline::new(store.clone(), exchange, rules, discrepancies.clone());
        Harness {
            store,
            mock,
            discrepancies,
            pipeline,
        }
    }

    #[test]
    fn test_size_entry_rounds_down_to_step() {
        let qty = size_entry(&rules(), dec!(50), dec!(1), dec!(0.3)).unwrap();
        assert_eq!(qty, dec!(166));
    }

    #[test]
    fn test_size_entry_raises_to_min_notional() {
        // 4 USDT at 0.5 is 8 units, below the 5 USDT minimum: raised to 10
        let qty = size_entry(&rules(), dec!(4), dec!(1), dec!(0.5)).unwrap();
        assert_eq!(qty, dec!(10));
        assert!(qty * dec!(0.5) >= dec!(5));

        let odd = size_entry(&rules(), dec!(1), dec!(1), dec!(0.3)).unwrap();
        assert_eq!(odd, dec!(17));
    }

    #[test]
    fn test_size_entry_rejects_invalid_inputs() {
        assert!(matches!(
            size_entry(&rules(), dec!(50), dec!(1), Decimal::ZERO),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            size_entry(&rules(), dec!(50), dec!(-1), dec!(0.5)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            size_entry(&rules(), dec!(1000000), dec!(1), dec!(0.5)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_trigger_prices_follow_side() {
        let protection = Protection {
            take_profit_pct: dec!(10),
            stop_loss_pct: dec!(5),
        };
        assert_eq!(
            protection.trigger_prices(OrderSide::Buy, dec!(0.5), dec!(0.0001)),
            (dec!(0.55), dec!(0.475))
        );
        assert_eq!(
            protection.trigger_prices(OrderSide::Sell, dec!(0.5), dec!(0.0001)),
            (dec!(0.45), dec!(0.525))
        );
    }

    #[tokio::test]
    async fn test_bracket_is_placed_and_persisted() {
        let h = harness().await;
        let submission = h
            .pipeline
            .submit(&strategy(Some(dec!(10)), Some(dec!(5))), "XYZUSDT", &buy(), dec!(0.5))
            .await
            .unwrap();

        let Submission::Bracket { link, persisted } = submission else {
            panic!("expected a bracket");
        };
        assert!(persisted);
        assert_eq!(h.mock.leverage("XYZUSDT").await, Some(3));

        let orders = h.store.bracket_orders(&link.group_id).await.unwrap().unwrap();
        assert_eq!(orders.entry.status, OrderStatus::Filled);
        assert_eq!(orders.entry.quantity, dec!(100));
        assert_eq!(orders.take_profit.side, OrderSide::Sell);
        assert_eq!(orders.take_profit.price, Some(dec!(0.55)));
        assert_eq!(orders.stop_loss.price, Some(dec!(0.475)));
        assert_eq!(orders.take_profit.status, OrderStatus::Submitted);
        assert_eq!(orders.take_profit.parent_order_id, orders.entry.id);

        let tp = h.mock.order(&link.tp_client_id).await.unwrap();
        assert!(tp.reduce_only);
        assert_ne!(link.tp_client_id, link.sl_client_id);
    }

    #[tokio::test]
    async fn test_single_sided_protection_is_rejected() {
        let h = harness().await;
        let result = h
            .pipeline
            .submit(&strategy(Some(dec!(10)), None), "XYZUSDT", &buy(), dec!(0.5))
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(h.mock.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_unprotected_entry_is_persisted_without_link() {
        let h = harness().await;
        let submission = h
            .pipeline
            .submit(&strategy(None, None), "XYZUSDT", &buy(), dec!(0.5))
            .await
            .unwrap();

        let Submission::Entry { order, persisted } = submission else {
            panic!("expected a plain entry");
        };
        assert!(persisted);
        assert!(order.group_id.is_none());
        assert!(h.store.get_order(&order.client_order_id).await.unwrap().is_some());
        assert!(h.store.list_open_brackets().await.unwrap().is_empty());
    }

    /// Rejects every stop-loss leg, delegating everything else.
    struct RejectStopLoss(Arc<MockExchange>);

    #[async_trait::async_trait]
    impl ExchangeClient for RejectStopLoss {
        async fn submit_order(&self, order: &NewOrder) -> std::result::Result<OrderAck, ExchangeError> {
            self.0.submit_order(order).await
        }

        async fn submit_conditional_order(
            &self,
            order: &ConditionalOrder,
        ) -> std::result::Result<OrderAck, ExchangeError> {
            if order.client_algo_id.ends_with("-sl") {
                return Err(ExchangeError::Rejected {
                    code: -2021,
                    message: "Order would immediately trigger.".into(),
                });
            }
            self.0.submit_conditional_order(order).await
        }

        async fn cancel_order(&self, leg: &crate::exchange::LegRef) -> std::result::Result<(), ExchangeError> {
            self.0.cancel_order(leg).await
        }

        async fn query_status(
            &self,
            leg: &crate::exchange::LegRef,
        ) -> std::result::Result<crate::exchange::OrderStatusReport, ExchangeError> {
            self.0.query_status(leg).await
        }

        async fn set_leverage(&self, symbol: &str, leverage: u8) -> std::result::Result<(), ExchangeError> {
            self.0.set_leverage(symbol, leverage).await
        }

        async fn trading_rules(&self, symbol: &str) -> std::result::Result<TradingRules, ExchangeError> {
            self.0.trading_rules(symbol).await
        }

        async fn market_snapshot(
            &self,
            symbol: &str,
        ) -> std::result::Result<crate::exchange::MarketSnapshot, ExchangeError> {
            self.0.market_snapshot(symbol).await
        }
    }

    #[tokio::test]
    async fn test_stop_loss_failure_orphans_and_cancels_take_profit() {
        let h = harness().await;
        let failing = Arc::new(RejectStopLoss(h.mock.clone()));
        let pipeline = SubmissionPipeline::new(
            h.store.clone(),
            ResilientExchange::new(failing.clone(), RetryPolicy::immediate(3), Duration::from_secs(1)),
            Arc::new(TradingRulesCache::new(failing, Duration::from_secs(60))),
            h.discrepancies.clone(),
        );

        let result = pipeline
            .submit(&strategy(Some(dec!(10)), Some(dec!(5))), "XYZUSDT", &buy(), dec!(0.5))
            .await;
        assert!(matches!(result, Err(Error::ExchangeRejection(_))));

        let link = h.store.list_brackets(1).await.unwrap().remove(0);
        assert_eq!(link.status, BracketStatus::Orphaned);
        assert_eq!(h.mock.order(&link.tp_client_id).await.unwrap().status, "CANCELED");

        let orders = h.store.bracket_orders(&link.group_id).await.unwrap().unwrap();
        assert_eq!(orders.take_profit.status, OrderStatus::Cancelled);
        assert_eq!(orders.stop_loss.status, OrderStatus::Failed);
        assert!(h.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_leg_leaves_orphaned_link() {
        let h = harness().await;
        h.mock
            .fail_next(
                MockOp::SubmitConditional,
                ExchangeError::Rejected {
                    code: -2021,
                    message: "Order would immediately trigger.".into(),
                },
                1,
            )
            .await;

        let result = h
            .pipeline
            .submit(&strategy(Some(dec!(10)), Some(dec!(5))), "XYZUSDT", &buy(), dec!(0.5))
            .await;
        assert!(matches!(result, Err(Error::ExchangeRejection(_))));

        let links = h.store.list_brackets(10).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].status, BracketStatus::Orphaned);
        assert!(links[0].close_reason.as_deref().unwrap().contains("protection failed"));

        let orders = h.store.bracket_orders(&links[0].group_id).await.unwrap().unwrap();
        assert_eq!(orders.entry.status, OrderStatus::Filled);
        assert_eq!(orders.take_profit.status, OrderStatus::Failed);
        assert_eq!(orders.stop_loss.status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn test_position_limit_blocks_entry() {
        let h = harness().await;
        let mut limited = strategy(None, None);
        limited.risk.max_position_qty = Some(dec!(150));

        h.pipeline
            .submit(&limited, "XYZUSDT", &buy(), dec!(0.5))
            .await
            .unwrap();
        let second = h.pipeline.submit(&limited, "XYZUSDT", &buy(), dec!(0.5)).await;

        assert!(matches!(second, Err(Error::Validation(_))));
        assert_eq!(h.mock.order_count().await, 1);
    }

    #[tokio::test]
    async fn test_lost_entry_ack_is_recovered_not_resubmitted() {
        let h = harness().await;
        h.mock.drop_ack_next(MockOp::Submit).await;

        let submission = h
            .pipeline
            .submit(&strategy(Some(dec!(10)), Some(dec!(5))), "XYZUSDT", &buy(), dec!(0.5))
            .await
            .unwrap();

        assert!(submission.persisted());
        // One entry and two legs, no duplicate entry
        assert_eq!(h.mock.order_count().await, 3);
        assert!(h.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_no_op_is_not_submitted() {
        let h = harness().await;
        let result = h
            .pipeline
            .submit(&strategy(None, None), "XYZUSDT", &Decision::no_op("flat"), dec!(0.5))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
