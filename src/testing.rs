//! Fixtures shared by unit tests.

use crate::bracket::{
    BracketDraft, BracketLink, BracketOrders, BracketStatus, OrderKind, OrderStatus,
    ScheduledOrder,
};
use crate::exchange::mock::MockExchange;
use crate::exchange::{ConditionalOrder, ExchangeClient, NewOrder, OrderSide, OrderType};
use crate::persistence::Store;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Long bracket: 100 filled at 0.5, TP at 0.55, SL at 0.45. Client ids are
/// `<group>-e`, `<group>-tp` and `<group>-sl`.
pub(crate) fn bracket_draft(group_id: &str, symbol: &str, strategy_id: &str) -> BracketDraft {
    let now = Utc::now();
    let order = |suffix: &str, side: OrderSide, kind: OrderKind, price: Option<Decimal>| {
        ScheduledOrder {
            id: None,
            strategy_id: strategy_id.to_string(),
            group_id: Some(group_id.to_string()),
            symbol: symbol.to_string(),
            side,
            kind,
            quantity: dec!(100),
            price,
            client_order_id: format!("{}-{}", group_id, suffix),
            exchange_order_id: None,
            status: OrderStatus::Submitted,
            executed_qty: Decimal::ZERO,
            avg_price: None,
            parent_order_id: None,
            trigger_time: None,
            created_at: now,
        }
    };

    let mut entry = order("e", OrderSide::Buy, OrderKind::Market, None);
    entry.status = OrderStatus::Filled;
    entry.executed_qty = dec!(100);
    entry.avg_price = Some(dec!(0.5));

    BracketDraft {
        link: BracketLink {
            group_id: group_id.to_string(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            entry_client_id: format!("{}-e", group_id),
            tp_client_id: format!("{}-tp", group_id),
            sl_client_id: format!("{}-sl", group_id),
            status: BracketStatus::Active,
            closed_leg: None,
            close_reason: None,
            sibling_cancel_error: None,
            created_at: now,
            closed_at: None,
        },
        orders: BracketOrders {
            entry,
            take_profit: order("tp", OrderSide::Sell, OrderKind::TakeProfit, Some(dec!(0.55))),
            stop_loss: order("sl", OrderSide::Sell, OrderKind::StopLoss, Some(dec!(0.45))),
        },
    }
}

/// Place the draft's three orders on the mock exchange and persist it.
pub(crate) async fn seed_bracket(
    store: &Store,
    exchange: &MockExchange,
    group_id: &str,
    symbol: &str,
) -> BracketLink {
    let draft = bracket_draft(group_id, symbol, "s-1");
    exchange.set_mark_price(symbol, dec!(0.5)).await;

    let entry = &draft.orders.entry;
    exchange
        .submit_order(&NewOrder {
            symbol: symbol.to_string(),
            side: entry.side,
            order_type: OrderType::Market,
            quantity: entry.quantity,
            price: None,
            time_in_force: None,
            reduce_only: false,
            new_client_order_id: entry.client_order_id.clone(),
        })
        .await
        .unwrap();

    for (leg, order_type) in [
        (&draft.orders.take_profit, OrderType::TakeProfitMarket),
        (&draft.orders.stop_loss, OrderType::StopMarket),
    ] {
        exchange
            .submit_conditional_order(&ConditionalOrder {
                symbol: symbol.to_string(),
                side: leg.side,
                order_type,
                trigger_price: leg.price.unwrap(),
                quantity: leg.quantity,
                reduce_only: true,
                client_algo_id: leg.client_order_id.clone(),
            })
            .await
            .unwrap();
    }

    store.create_bracket(&draft).await.unwrap();
    draft.link
}
