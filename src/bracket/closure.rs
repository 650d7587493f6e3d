//! Bracket closure: when one leg triggers, close the link and cancel the
//! sibling exactly once.
//!
//! Two layers keep closure idempotent:
//! - an in-process in-flight set, so concurrent events for the same group
//!   inside one process collapse into one handler run
//! - compare-and-set transitions in the store (`active → closing → closed`),
//!   so a repeated event for a link that already moved is a no-op
//!
//! `begin_closing` records which handler owns the closure. Another handler
//! (in this process or another one) only resumes a `closing` link once that
//! claim is older than the takeover window, and only the current owner can
//! commit `closed`.
//!
//! Sibling cancellation failures never block the closure commit. They are
//! logged and stored on the link for manual follow-up.

use super::model::{BracketLeg, BracketLink, BracketStatus, OrderStatus, OrderUpdate};
use crate::error::{Error, ExchangeError, Result};
use crate::exchange::{ExchangeClient, LegRef, ResilientExchange};
use crate::persistence::{ClosureRecord, Store, StoreError};
use crate::reconcile::{normalize_status, NormalizedStatus};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureOutcome {
    /// This call closed the link.
    Closed {
        leg: BracketLeg,
        sibling_cancelled: bool,
    },
    /// The link was already closing/closed (or being handled) elsewhere.
    AlreadyHandled,
}

/// Removes the group from the in-flight set when dropped.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    group_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.group_id);
        }
    }
}

pub struct ClosureHandler {
    store: Store,
    exchange: ResilientExchange,
    /// Closing claim token written to the store
    owner: String,
    takeover_after: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl ClosureHandler {
    /// `exchange` carries the cancellation retry budget. `takeover_after`
    /// must exceed the longest closure (sibling cancel with all retries).
    pub fn new(store: Store, exchange: ResilientExchange, takeover_after: Duration) -> Self {
        Self {
            store,
            exchange,
            owner: format!("closure:{}", Uuid::new_v4().simple()),
            takeover_after,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_in_flight(&self, group_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(group_id))
            .unwrap_or(false)
    }

    fn claim(&self, group_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(group_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            group_id: group_id.to_string(),
        })
    }

    /// Handle a triggered leg of an `active` link.
    pub async fn on_leg_triggered(
        &self,
        link: &BracketLink,
        leg: BracketLeg,
    ) -> Result<ClosureOutcome> {
        let Some(_guard) = self.claim(&link.group_id) else {
            debug!(group_id = %link.group_id, "Closure already in flight");
            return Ok(ClosureOutcome::AlreadyHandled);
        };

        if !self.store.begin_closing(&link.group_id, leg, &self.owner).await? {
            debug!(group_id = %link.group_id, "Bracket already closing or closed");
            return Ok(ClosureOutcome::AlreadyHandled);
        }

        info!(
            group_id = %link.group_id,
            symbol = %link.symbol,
            %leg,
            triggered_client_id = %link.leg_client_id(leg),
            sibling_client_id = %link.leg_client_id(leg.sibling()),
            "Bracket leg triggered, closing"
        );

        self.complete(link, leg).await
    }

    /// Finish a link left in `closing` (process died mid-closure or the
    /// final write failed). A claim younger than the takeover window is
    /// left to its owner.
    pub async fn resume(&self, link: &BracketLink) -> Result<ClosureOutcome> {
        let Some(_guard) = self.claim(&link.group_id) else {
            return Ok(ClosureOutcome::AlreadyHandled);
        };

        if !self
            .store
            .take_over_closing(&link.group_id, &self.owner, self.takeover_after)
            .await?
        {
            debug!(group_id = %link.group_id, "Closure owned elsewhere and not stale");
            return Ok(ClosureOutcome::AlreadyHandled);
        }

        // The listing may be stale by the time the claim is won
        let link = match self.store.get_bracket(&link.group_id).await? {
            Some(current) if current.status == BracketStatus::Closing => current,
            _ => return Ok(ClosureOutcome::AlreadyHandled),
        };

        let leg = link.closed_leg.ok_or_else(|| {
            Error::Persistence(StoreError::Corrupt(format!(
                "closing bracket {} has no triggered leg",
                link.group_id
            )))
        })?;

        warn!(group_id = %link.group_id, %leg, "Resuming interrupted bracket closure");
        self.complete(&link, leg).await
    }

    async fn complete(&self, link: &BracketLink, leg: BracketLeg) -> Result<ClosureOutcome> {
        let sibling = leg.sibling();
        let sibling_ref = LegRef {
            symbol: link.symbol.clone(),
            client_id: link.leg_client_id(sibling).to_string(),
            conditional: true,
        };

        let (sibling_cancelled, sibling_cancel_error) =
            match self.exchange.cancel_order(&sibling_ref).await {
                Ok(()) => {
                    info!(
                        group_id = %link.group_id,
                        client_id = %sibling_ref.client_id,
                        "Sibling leg cancelled"
                    );
                    (true, None)
                }
                Err(ExchangeError::NotFound(msg)) => {
                    (false, Some(self.settle_missing_sibling(link, &sibling_ref, msg).await))
                }
                Err(e) => {
                    error!(
                        group_id = %link.group_id,
                        symbol = %link.symbol,
                        client_id = %sibling_ref.client_id,
                        error = %e,
                        "Failed to cancel sibling, sibling leg may remain open on the exchange; manual attention required"
                    );
                    (false, Some(e.to_string()))
                }
            };

        let record = ClosureRecord {
            closed_at: Utc::now(),
            reason: format!("{} triggered", leg),
            sibling_cancelled,
            sibling_cancel_error,
        };

        if !self
            .store
            .finish_closing(&link.group_id, &self.owner, &record)
            .await?
        {
            return Ok(ClosureOutcome::AlreadyHandled);
        }

        info!(
            group_id = %link.group_id,
            symbol = %link.symbol,
            %leg,
            sibling_cancelled,
            "Bracket closed"
        );

        Ok(ClosureOutcome::Closed {
            leg,
            sibling_cancelled,
        })
    }

    /// The sibling was no longer open. Find out why and record it; a sibling
    /// that also executed means the position was closed twice.
    async fn settle_missing_sibling(
        &self,
        link: &BracketLink,
        sibling_ref: &LegRef,
        reason: String,
    ) -> String {
        let report = match self.exchange.query_status(sibling_ref).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    group_id = %link.group_id,
                    client_id = %sibling_ref.client_id,
                    error = %e,
                    "Sibling leg not open and its status is unavailable"
                );
                return format!("sibling not open: {}", reason);
            }
        };

        let normalized = normalize_status(&report.status);
        if let Some(status) = normalized.order_status() {
            let mut update = OrderUpdate::status(status);
            update.executed_qty = report.executed_qty;
            update.avg_price = report.avg_price;
            update.trigger_time = report.updated_at;
            if let Err(e) = self
                .store
                .apply_order_update(&sibling_ref.client_id, &update)
                .await
            {
                warn!(client_id = %sibling_ref.client_id, error = %e, "Failed to record sibling status");
            }
        }

        if normalized == NormalizedStatus::Triggered {
            error!(
                group_id = %link.group_id,
                symbol = %link.symbol,
                client_id = %sibling_ref.client_id,
                "Both bracket legs executed, position closed twice; manual attention required"
            );
            if let Err(e) = self
                .store
                .flag_for_review(
                    &sibling_ref.client_id,
                    Some(&link.group_id),
                    "both legs executed",
                )
                .await
            {
                warn!(error = %e, "Failed to record review item");
            }
        }

        format!("sibling not open ({})", report.status)
    }

    /// `active → orphaned`, then cancel both conditional legs best-effort.
    /// Returns false if the link had already moved on.
    pub async fn orphan(&self, link: &BracketLink, reason: &str) -> Result<bool> {
        let Some(_guard) = self.claim(&link.group_id) else {
            return Ok(false);
        };

        if !self
            .store
            .mark_orphaned(&link.group_id, reason, Utc::now())
            .await?
        {
            return Ok(false);
        }

        warn!(group_id = %link.group_id, symbol = %link.symbol, %reason, "Bracket orphaned");

        // Orphaned links are never polled again: try every cancel before
        // touching any row
        let mut cancelled = Vec::new();
        for leg in [BracketLeg::TakeProfit, BracketLeg::StopLoss] {
            let leg_ref = LegRef {
                symbol: link.symbol.clone(),
                client_id: link.leg_client_id(leg).to_string(),
                conditional: true,
            };
            match self.exchange.cancel_order(&leg_ref).await {
                Ok(()) => cancelled.push(leg_ref.client_id),
                Err(ExchangeError::NotFound(_)) => {
                    debug!(client_id = %leg_ref.client_id, "Orphaned leg already gone");
                }
                Err(e) => {
                    error!(
                        group_id = %link.group_id,
                        client_id = %leg_ref.client_id,
                        error = %e,
                        "Failed to cancel leg of orphaned bracket; manual attention required"
                    );
                }
            }
        }

        for client_id in &cancelled {
            let update = OrderUpdate::status(OrderStatus::Cancelled);
            if let Err(e) = self.store.apply_order_update(client_id, &update).await {
                error!(
                    group_id = %link.group_id,
                    %client_id,
                    error = %e,
                    "Leg cancelled but its row was not updated; manual attention required"
                );
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockOp};
    use crate::testing::{bracket_draft, seed_bracket};
    use crate::utils::RetryPolicy;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    fn handler(store: &Store, mock: &Arc<MockExchange>) -> ClosureHandler {
        handler_with_takeover(store, mock, Duration::from_secs(120))
    }

    fn handler_with_takeover(
        store: &Store,
        mock: &Arc<MockExchange>,
        takeover_after: Duration,
    ) -> ClosureHandler {
        let exchange = ResilientExchange::new(
            mock.clone(),
            RetryPolicy::immediate(3),
            Duration::from_secs(1),
        );
        ClosureHandler::new(store.clone(), exchange, takeover_after)
    }

    #[tokio::test]
    async fn test_trigger_closes_and_cancels_sibling_once() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        let handler = handler(&store, &mock);

        let outcome = handler
            .on_leg_triggered(&link, BracketLeg::TakeProfit)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ClosureOutcome::Closed {
                leg: BracketLeg::TakeProfit,
                sibling_cancelled: true
            }
        );

        // Repeated event: no second cancel, no second write
        let again = handler
            .on_leg_triggered(&link, BracketLeg::TakeProfit)
            .await
            .unwrap();
        assert_eq!(again, ClosureOutcome::AlreadyHandled);
        assert_eq!(mock.cancel_calls(&link.sl_client_id).await, 1);

        let stored = store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
        assert_eq!(stored.closed_leg, Some(BracketLeg::TakeProfit));
        assert!(stored.sibling_cancel_error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_failure_does_not_block_closure() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        mock.fail_client(
            MockOp::Cancel,
            &link.sl_client_id,
            ExchangeError::Transport("connection reset".into()),
            u32::MAX,
        )
        .await;
        let handler = handler(&store, &mock);

        let outcome = handler
            .on_leg_triggered(&link, BracketLeg::TakeProfit)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ClosureOutcome::Closed {
                leg: BracketLeg::TakeProfit,
                sibling_cancelled: false
            }
        );
        assert_eq!(mock.cancel_calls(&link.sl_client_id).await, 3);

        let stored = store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
        assert!(stored.sibling_cancel_error.unwrap().contains("connection reset"));

        let sl = store.get_order(&link.sl_client_id).await.unwrap().unwrap();
        assert_eq!(sl.status, OrderStatus::Submitted);
    }

    #[tokio::test]
    async fn test_resume_finishes_interrupted_closure() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        store
            .begin_closing("g1", BracketLeg::StopLoss, "crashed")
            .await
            .unwrap();

        let closing = store.get_bracket("g1").await.unwrap().unwrap();
        let handler = handler_with_takeover(&store, &mock, Duration::ZERO);
        let outcome = handler.resume(&closing).await.unwrap();

        assert!(matches!(
            outcome,
            ClosureOutcome::Closed {
                leg: BracketLeg::StopLoss,
                ..
            }
        ));
        assert_eq!(mock.cancel_calls(&link.tp_client_id).await, 1);
    }

    #[tokio::test]
    async fn test_fresh_claim_of_another_handler_is_not_resumed() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new().with_latency(Duration::from_millis(50)));
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        mock.set_mark_price("XYZUSDT", dec!(0.56)).await;

        let first = handler(&store, &mock);
        let second = handler(&store, &mock);

        let (a, b) = tokio::join!(first.on_leg_triggered(&link, BracketLeg::TakeProfit), async {
            // Let the first handler commit `closing` and start cancelling
            tokio::time::sleep(Duration::from_millis(20)).await;
            let closing = store.get_bracket("g1").await.unwrap().unwrap();
            second.resume(&closing).await
        });

        assert!(matches!(a.unwrap(), ClosureOutcome::Closed { .. }));
        assert_eq!(b.unwrap(), ClosureOutcome::AlreadyHandled);
        assert_eq!(mock.cancel_calls(&link.sl_client_id).await, 1);

        let stored = store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
    }

    #[tokio::test]
    async fn test_orphan_cancels_both_legs_when_a_row_update_fails() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        store
            .execute_sql("UPDATE scheduled_orders SET status = 'bogus' WHERE client_order_id = 'g1-tp'")
            .await
            .unwrap();

        let handler = handler(&store, &mock);
        assert!(handler.orphan(&link, "entry cancelled").await.unwrap());

        assert_eq!(mock.order(&link.tp_client_id).await.unwrap().status, "CANCELED");
        assert_eq!(mock.order(&link.sl_client_id).await.unwrap().status, "CANCELED");
        assert_eq!(mock.cancel_calls(&link.sl_client_id).await, 1);

        let sl = store.get_order(&link.sl_client_id).await.unwrap().unwrap();
        assert_eq!(sl.status, OrderStatus::Cancelled);
        let stored = store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Orphaned);
    }

    #[tokio::test]
    async fn test_sibling_already_executed_is_flagged() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        mock.set_status(&link.sl_client_id, "FINISHED").await;

        let handler = handler(&store, &mock);
        handler
            .on_leg_triggered(&link, BracketLeg::TakeProfit)
            .await
            .unwrap();

        let sl = store.get_order(&link.sl_client_id).await.unwrap().unwrap();
        assert_eq!(sl.status, OrderStatus::Filled);
        let reviews = store.list_reviews().await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].client_id, link.sl_client_id);
    }

    #[tokio::test]
    async fn test_orphan_cancels_both_legs() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let link = seed_bracket(&store, &mock, "g1", "XYZUSDT").await;
        let handler = handler(&store, &mock);

        assert!(handler.orphan(&link, "entry cancelled").await.unwrap());
        assert!(!handler.orphan(&link, "entry cancelled").await.unwrap());

        assert_eq!(mock.order(&link.tp_client_id).await.unwrap().status, "CANCELED");
        assert_eq!(mock.order(&link.sl_client_id).await.unwrap().status, "CANCELED");

        let stored = store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Orphaned);
        assert_eq!(stored.close_reason.as_deref(), Some("entry cancelled"));
    }

    #[tokio::test]
    async fn test_closed_link_cannot_be_orphaned() {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        // Legs never reached this exchange: the sibling cancel reports not-found
        let draft = bracket_draft("g2", "XYZUSDT", "s-1");
        store.create_bracket(&draft).await.unwrap();
        let handler = handler(&store, &mock);

        let outcome = handler
            .on_leg_triggered(&draft.link, BracketLeg::StopLoss)
            .await
            .unwrap();
        assert!(matches!(outcome, ClosureOutcome::Closed { sibling_cancelled: false, .. }));
        assert!(!handler.orphan(&draft.link, "late").await.unwrap());
    }
}
