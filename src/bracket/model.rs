//! Persistent data model: scheduled orders and the bracket links grouping them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::exchange::{LegRef, OrderSide};

/// What kind of order a [`ScheduledOrder`] row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    TakeProfit,
    StopLoss,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Market => "market",
            OrderKind::Limit => "limit",
            OrderKind::TakeProfit => "take_profit",
            OrderKind::StopLoss => "stop_loss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market" => Some(OrderKind::Market),
            "limit" => Some(OrderKind::Limit),
            "take_profit" => Some(OrderKind::TakeProfit),
            "stop_loss" => Some(OrderKind::StopLoss),
            _ => None,
        }
    }

    /// Conditional (algo) orders live on a separate exchange endpoint.
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderKind::TakeProfit | OrderKind::StopLoss)
    }
}

/// Lifecycle of a single order row.
///
/// Stages: `pending` (0) → `submitted` (1) → terminal (2). Stages never
/// regress. Within the terminal stage only `unknown` may still be resolved
/// into one of the other terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Cancelled,
    Failed,
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
            OrderStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "submitted" => Some(OrderStatus::Submitted),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "failed" => Some(OrderStatus::Failed),
            "unknown" => Some(OrderStatus::Unknown),
            _ => None,
        }
    }

    fn stage(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            _ => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage() == 2
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if *self == next {
            return false;
        }
        next.stage() > self.stage() || (*self == OrderStatus::Unknown && next.is_terminal())
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a bracket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketStatus {
    Active,
    Closing,
    Closed,
    Orphaned,
}

impl BracketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BracketStatus::Active => "active",
            BracketStatus::Closing => "closing",
            BracketStatus::Closed => "closed",
            BracketStatus::Orphaned => "orphaned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BracketStatus::Active),
            "closing" => Some(BracketStatus::Closing),
            "closed" => Some(BracketStatus::Closed),
            "orphaned" => Some(BracketStatus::Orphaned),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: BracketStatus) -> bool {
        matches!(
            (self, next),
            (BracketStatus::Active, BracketStatus::Closing)
                | (BracketStatus::Closing, BracketStatus::Closed)
                | (BracketStatus::Active, BracketStatus::Orphaned)
        )
    }
}

impl fmt::Display for BracketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the two conditional legs of a bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BracketLeg {
    #[serde(rename = "tp")]
    TakeProfit,
    #[serde(rename = "sl")]
    StopLoss,
}

impl BracketLeg {
    pub fn as_str(&self) -> &'static str {
        match self {
            BracketLeg::TakeProfit => "tp",
            BracketLeg::StopLoss => "sl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tp" => Some(BracketLeg::TakeProfit),
            "sl" => Some(BracketLeg::StopLoss),
            _ => None,
        }
    }

    pub fn sibling(&self) -> BracketLeg {
        match self {
            BracketLeg::TakeProfit => BracketLeg::StopLoss,
            BracketLeg::StopLoss => BracketLeg::TakeProfit,
        }
    }
}

impl fmt::Display for BracketLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single order submitted (or about to be) on behalf of a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledOrder {
    /// Store row id; `None` until persisted
    pub id: Option<i64>,
    pub strategy_id: String,
    pub group_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: Decimal,
    /// Limit price for entries, trigger price for TP/SL
    pub price: Option<Decimal>,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub executed_qty: Decimal,
    pub avg_price: Option<Decimal>,
    /// For TP/SL rows, the entry row id
    pub parent_order_id: Option<i64>,
    pub trigger_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledOrder {
    /// Reference used to cancel or query this order on the exchange.
    pub fn leg_ref(&self) -> LegRef {
        LegRef {
            symbol: self.symbol.clone(),
            client_id: self.client_order_id.clone(),
            conditional: self.kind.is_conditional(),
        }
    }
}

/// Groups an entry order with its take-profit and stop-loss legs.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketLink {
    pub group_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub entry_client_id: String,
    pub tp_client_id: String,
    pub sl_client_id: String,
    pub status: BracketStatus,
    pub closed_leg: Option<BracketLeg>,
    pub close_reason: Option<String>,
    /// Last sibling cancellation failure, kept for manual follow-up
    pub sibling_cancel_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl BracketLink {
    pub fn leg_client_id(&self, leg: BracketLeg) -> &str {
        match leg {
            BracketLeg::TakeProfit => &self.tp_client_id,
            BracketLeg::StopLoss => &self.sl_client_id,
        }
    }
}

/// The three order rows of a bracket.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketOrders {
    pub entry: ScheduledOrder,
    pub take_profit: ScheduledOrder,
    pub stop_loss: ScheduledOrder,
}

impl BracketOrders {
    pub fn leg(&self, leg: BracketLeg) -> &ScheduledOrder {
        match leg {
            BracketLeg::TakeProfit => &self.take_profit,
            BracketLeg::StopLoss => &self.stop_loss,
        }
    }

    pub fn leg_mut(&mut self, leg: BracketLeg) -> &mut ScheduledOrder {
        match leg {
            BracketLeg::TakeProfit => &mut self.take_profit,
            BracketLeg::StopLoss => &mut self.stop_loss,
        }
    }
}

/// A bracket accepted by the exchange, ready to be inserted in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketDraft {
    pub link: BracketLink,
    pub orders: BracketOrders,
}

/// Status change observed for an order on the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub status: OrderStatus,
    pub executed_qty: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub exchange_order_id: Option<String>,
    pub trigger_time: Option<DateTime<Utc>>,
}

impl OrderUpdate {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status,
            executed_qty: None,
            avg_price: None,
            exchange_order_id: None,
            trigger_time: None,
        }
    }
}

/// Net exposure derived from filled orders (never persisted).
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    /// Positive = long, negative = short
    pub net_qty: Decimal,
    pub avg_cost: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_is_monotonic() {
        use OrderStatus::*;

        assert!(Pending.can_transition_to(Submitted));
        assert!(Pending.can_transition_to(Failed));
        assert!(Submitted.can_transition_to(Filled));
        assert!(Unknown.can_transition_to(Filled));

        assert!(!Filled.can_transition_to(Pending));
        assert!(!Filled.can_transition_to(Submitted));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Filled));
        assert!(!Submitted.can_transition_to(Pending));
        assert!(!Filled.can_transition_to(Unknown));
        assert!(!Submitted.can_transition_to(Submitted));
    }

    #[test]
    fn test_bracket_status_transitions() {
        use BracketStatus::*;

        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(Active.can_transition_to(Orphaned));

        assert!(!Closed.can_transition_to(Active));
        assert!(!Closing.can_transition_to(Active));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Orphaned.can_transition_to(Active));
    }

    #[test]
    fn test_string_roundtrip_for_stored_enums() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Submitted,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
            OrderStatus::Unknown,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BracketLeg::parse("tp"), Some(BracketLeg::TakeProfit));
        assert_eq!(BracketLeg::TakeProfit.sibling(), BracketLeg::StopLoss);
        assert!(OrderKind::StopLoss.is_conditional());
        assert!(!OrderKind::Market.is_conditional());
    }
}
