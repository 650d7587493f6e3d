//! Periodic reconciliation of open bracket links against the exchange.

use super::discrepancy::{DiscrepancyQueue, PendingWrite};
use super::status::{normalize_status, NormalizedStatus};
use crate::bracket::{
    BracketLeg, BracketLink, BracketStatus, ClosureHandler, ClosureOutcome, OrderStatus,
    OrderUpdate, ScheduledOrder,
};
use crate::config::ReconciliationConfig;
use crate::error::{Error, ExchangeError, Result};
use crate::exchange::{ExchangeClient, OrderStatusReport, ResilientExchange};
use crate::persistence::Store;
use crate::utils::{shutdown_requested, ServiceHandle};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Counters for one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    /// Order rows whose status moved
    pub updated: usize,
    pub closed: usize,
    pub orphaned: usize,
    /// Legs reporting a status outside the mapping table
    pub ambiguous: usize,
    /// Queued writes that made it into the store
    pub recovered: usize,
    pub errors: usize,
}

impl CycleReport {
    pub fn has_activity(&self) -> bool {
        self.updated + self.closed + self.orphaned + self.ambiguous + self.recovered + self.errors
            > 0
    }

    fn absorb(&mut self, link: LinkReport) {
        self.polled += 1;
        self.updated += link.updated;
        self.ambiguous += link.ambiguous;
        match link.outcome {
            LinkOutcome::Closed => self.closed += 1,
            LinkOutcome::Orphaned => self.orphaned += 1,
            LinkOutcome::Unchanged => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LinkOutcome {
    #[default]
    Unchanged,
    Closed,
    Orphaned,
}

#[derive(Debug, Default)]
struct LinkReport {
    updated: usize,
    ambiguous: usize,
    outcome: LinkOutcome,
}

/// What a poll learned about one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegState {
    Known(NormalizedStatus),
    /// The exchange has no such order
    Missing,
    /// Unmapped status, re-polled next cycle
    Ambiguous,
}

impl LegState {
    fn from_row(status: OrderStatus) -> Option<Self> {
        match status {
            OrderStatus::Filled => Some(LegState::Known(NormalizedStatus::Triggered)),
            OrderStatus::Cancelled => Some(LegState::Known(NormalizedStatus::Cancelled)),
            OrderStatus::Failed => Some(LegState::Known(NormalizedStatus::Rejected)),
            _ => None,
        }
    }

    fn is_triggered(&self) -> bool {
        *self == LegState::Known(NormalizedStatus::Triggered)
    }

    /// Will never execute: cancelled, rejected or gone.
    fn is_dead(&self) -> bool {
        match self {
            LegState::Known(status) => status.is_dead(),
            LegState::Missing => true,
            LegState::Ambiguous => false,
        }
    }
}

fn update_from_report(status: OrderStatus, report: &OrderStatusReport) -> OrderUpdate {
    OrderUpdate {
        status,
        executed_qty: report.executed_qty,
        avg_price: report.avg_price,
        exchange_order_id: report.exchange_order_id.clone(),
        trigger_time: if status == OrderStatus::Filled {
            report.updated_at
        } else {
            None
        },
    }
}

pub struct ReconciliationLoop {
    store: Store,
    exchange: ResilientExchange,
    closure: Arc<ClosureHandler>,
    discrepancies: Arc<DiscrepancyQueue>,
    config: ReconciliationConfig,
}

impl ReconciliationLoop {
    pub fn new(
        store: Store,
        exchange: ResilientExchange,
        closure: Arc<ClosureHandler>,
        discrepancies: Arc<DiscrepancyQueue>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            exchange,
            closure,
            discrepancies,
            config,
        }
    }

    /// Run the loop on its own interval until stopped.
    pub fn start(self: Arc<Self>) -> ServiceHandle {
        ServiceHandle::spawn("reconciler", move |mut shutdown| async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = self.config.interval_secs,
                batch_size = self.config.batch_size,
                "Reconciliation loop running"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.has_activity() => {
                                info!(?report, "Reconciliation cycle complete");
                            }
                            Ok(report) => debug!(polled = report.polled, "Reconciliation cycle idle"),
                            Err(e) => error!(error = %e, kind = e.kind(), "Reconciliation cycle failed"),
                        }
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        })
    }

    /// One full cycle: retry queued writes, then poll every open link.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        self.drain_discrepancies(&mut report).await;

        let links = self.store.list_open_brackets().await?;
        if links.is_empty() {
            return Ok(report);
        }

        let pending_reviews: HashSet<String> = self
            .store
            .list_reviews()
            .await?
            .into_iter()
            .map(|item| item.client_id)
            .collect();

        let batch_size = self.config.batch_size.max(1);
        let batches = links.chunks(batch_size).count();

        for (i, batch) in links.chunks(batch_size).enumerate() {
            let results = join_all(
                batch
                    .iter()
                    .map(|link| self.reconcile_link(link, &pending_reviews)),
            )
            .await;

            for (link, result) in batch.iter().zip(results) {
                match result {
                    Ok(link_report) => report.absorb(link_report),
                    Err(e) => {
                        report.polled += 1;
                        report.errors += 1;
                        warn!(
                            group_id = %link.group_id,
                            symbol = %link.symbol,
                            error = %e,
                            kind = e.kind(),
                            "Failed to reconcile bracket"
                        );
                    }
                }
            }

            if i + 1 < batches && !self.config.batch_pause().is_zero() {
                tokio::time::sleep(self.config.batch_pause()).await;
            }
        }

        Ok(report)
    }

    async fn reconcile_link(
        &self,
        link: &BracketLink,
        pending_reviews: &HashSet<String>,
    ) -> Result<LinkReport> {
        let mut report = LinkReport::default();

        if link.status == BracketStatus::Closing {
            if self.closure.is_in_flight(&link.group_id) {
                return Ok(report);
            }
            if let ClosureOutcome::Closed { .. } = self.closure.resume(link).await? {
                report.outcome = LinkOutcome::Closed;
            }
            return Ok(report);
        }

        let orders = self.store.bracket_orders(&link.group_id).await?.ok_or_else(|| {
            Error::NotFound(format!("orders of bracket {}", link.group_id))
        })?;

        let entry = self.poll(link, &orders.entry, pending_reviews, &mut report).await?;
        let tp = self.poll(link, &orders.take_profit, pending_reviews, &mut report).await?;
        let sl = self.poll(link, &orders.stop_loss, pending_reviews, &mut report).await?;

        let triggered = match (tp.is_triggered(), sl.is_triggered()) {
            (true, true) => {
                error!(
                    group_id = %link.group_id,
                    symbol = %link.symbol,
                    tp_client_id = %link.tp_client_id,
                    sl_client_id = %link.sl_client_id,
                    "Both bracket legs triggered, position closed twice; manual attention required"
                );
                self.store
                    .flag_for_review(&link.tp_client_id, Some(&link.group_id), "both legs triggered")
                    .await?;
                Some(BracketLeg::TakeProfit)
            }
            (true, false) => Some(BracketLeg::TakeProfit),
            (false, true) => Some(BracketLeg::StopLoss),
            (false, false) => None,
        };

        if let Some(leg) = triggered {
            if let ClosureOutcome::Closed { .. } = self.closure.on_leg_triggered(link, leg).await? {
                report.outcome = LinkOutcome::Closed;
            }
            return Ok(report);
        }

        let orphan_reason = if entry.is_dead() {
            Some(match entry {
                LegState::Missing => "entry not found on exchange",
                _ => "entry cancelled or rejected before any leg triggered",
            })
        } else if tp.is_dead() && sl.is_dead() {
            Some("both legs cancelled, rejected or missing")
        } else {
            None
        };

        if let Some(reason) = orphan_reason {
            if self.closure.orphan(link, reason).await? {
                report.outcome = LinkOutcome::Orphaned;
            }
        }

        Ok(report)
    }

    /// Query one order (unless its stored status is already final) and
    /// apply what the exchange reports.
    async fn poll(
        &self,
        link: &BracketLink,
        order: &ScheduledOrder,
        pending_reviews: &HashSet<String>,
        report: &mut LinkReport,
    ) -> Result<LegState> {
        if let Some(state) = LegState::from_row(order.status) {
            return Ok(state);
        }

        let leg_ref = order.leg_ref();
        let status_report = match self.exchange.query_status(&leg_ref).await {
            Ok(status_report) => status_report,
            Err(ExchangeError::NotFound(_)) => {
                warn!(
                    group_id = %link.group_id,
                    client_id = %order.client_order_id,
                    "Order not found on exchange"
                );
                if self
                    .store
                    .apply_order_update(&order.client_order_id, &OrderUpdate::status(OrderStatus::Unknown))
                    .await?
                {
                    report.updated += 1;
                }
                return Ok(LegState::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let normalized = normalize_status(&status_report.status);
        let Some(status) = normalized.order_status() else {
            let ambiguity = Error::ReconciliationAmbiguity {
                client_id: order.client_order_id.clone(),
                status: status_report.status.clone(),
            };
            warn!(
                group_id = %link.group_id,
                symbol = %link.symbol,
                error = %ambiguity,
                "Leaving order untouched until its status is recognized"
            );
            self.store
                .record_ambiguity(
                    &order.client_order_id,
                    Some(&link.group_id),
                    &status_report.status,
                    self.config.review_threshold,
                )
                .await?;
            report.ambiguous += 1;
            return Ok(LegState::Ambiguous);
        };

        if pending_reviews.contains(&order.client_order_id) {
            self.store.clear_ambiguity(&order.client_order_id).await?;
        }

        if self
            .store
            .apply_order_update(
                &order.client_order_id,
                &update_from_report(status, &status_report),
            )
            .await?
        {
            debug!(
                client_id = %order.client_order_id,
                from = %order.status,
                to = %status,
                raw = %status_report.status,
                "Order status updated"
            );
            report.updated += 1;
        }

        Ok(LegState::Known(normalized))
    }

    async fn drain_discrepancies(&self, report: &mut CycleReport) {
        for item in self.discrepancies.drain() {
            match self.recover(&item).await {
                Ok(()) => {
                    info!(key = %item.key(), symbol = %item.symbol(), "Queued write recovered");
                    report.recovered += 1;
                }
                Err(e) => {
                    warn!(
                        key = %item.key(),
                        error = %e,
                        "Queued write still failing, retrying next cycle"
                    );
                    report.errors += 1;
                    self.discrepancies.push(item);
                }
            }
        }
    }

    /// Refresh the statuses of a queued write from the exchange, then insert it.
    async fn recover(&self, item: &PendingWrite) -> Result<()> {
        match item {
            PendingWrite::Bracket(draft) => {
                let mut draft = draft.clone();
                for order in [
                    &mut draft.orders.entry,
                    &mut draft.orders.take_profit,
                    &mut draft.orders.stop_loss,
                ] {
                    self.refresh_order(order).await?;
                }
                self.store.create_bracket(&draft).await?;
            }
            PendingWrite::Order(order) => {
                if self.store.get_order(&order.client_order_id).await?.is_some() {
                    return Ok(());
                }
                let mut order = order.clone();
                self.refresh_order(&mut order).await?;
                self.store.insert_order(&order).await?;
            }
        }
        Ok(())
    }

    async fn refresh_order(&self, order: &mut ScheduledOrder) -> Result<()> {
        let status_report = match self.exchange.query_status(&order.leg_ref()).await {
            Ok(status_report) => status_report,
            Err(ExchangeError::NotFound(_)) => {
                if order.status.can_transition_to(OrderStatus::Unknown) {
                    order.status = OrderStatus::Unknown;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(status) = normalize_status(&status_report.status).order_status() {
            if order.status.can_transition_to(status) {
                order.status = status;
            }
            if let Some(qty) = status_report.executed_qty {
                order.executed_qty = qty;
            }
            order.avg_price = status_report.avg_price.or(order.avg_price);
            if status == OrderStatus::Filled && order.trigger_time.is_none() {
                order.trigger_time = status_report.updated_at;
            }
        }
        if order.exchange_order_id.is_none() {
            order.exchange_order_id = status_report.exchange_order_id;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockOp};
    use crate::testing::{bracket_draft, seed_bracket};
    use crate::utils::RetryPolicy;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        store: Store,
        mock: Arc<MockExchange>,
        discrepancies: Arc<DiscrepancyQueue>,
        reconciler: ReconciliationLoop,
    }

    fn harness() -> Harness {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(MockExchange::new());
        let exchange = ResilientExchange::new(
            mock.clone(),
            RetryPolicy::immediate(3),
            Duration::from_secs(1),
        );
        let closure = Arc::new(ClosureHandler::new(
            store.clone(),
            exchange.clone(),
            Duration::from_secs(120),
        ));
        let discrepancies = Arc::new(DiscrepancyQueue::new());
        let config = ReconciliationConfig {
            batch_pause_ms: 0,
            review_threshold: 3,
            ..ReconciliationConfig::default()
        };
        let reconciler = ReconciliationLoop::new(
            store.clone(),
            exchange,
            closure,
            discrepancies.clone(),
            config,
        );
        Harness {
            store,
            mock,
            discrepancies,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_quiet_cycle_changes_nothing() {
        let h = harness();
        seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.polled, 1);
        assert!(!report.has_activity());

        let link = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(link.status, BracketStatus::Active);
    }

    #[tokio::test]
    async fn test_triggered_stop_loss_closes_link() {
        let h = harness();
        let link = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;

        let fired = h.mock.set_mark_price("XYZUSDT", dec!(0.44)).await;
        assert_eq!(fired, vec![link.sl_client_id.clone()]);

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.closed, 1);

        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
        assert_eq!(stored.closed_leg, Some(BracketLeg::StopLoss));
        assert_eq!(h.mock.order(&link.tp_client_id).await.unwrap().status, "CANCELED");

        let tp = h.store.get_order(&link.tp_client_id).await.unwrap().unwrap();
        assert_eq!(tp.status, OrderStatus::Cancelled);

        // Closed links are no longer polled
        let again = h.reconciler.run_once().await.unwrap();
        assert_eq!(again.polled, 0);
        assert_eq!(h.mock.cancel_calls(&link.tp_client_id).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_status_goes_to_review_not_closure() {
        let h = harness();
        let link = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        h.mock.set_status(&link.tp_client_id, "NEW_INSURANCE").await;

        for _ in 0..3 {
            let report = h.reconciler.run_once().await.unwrap();
            assert_eq!(report.ambiguous, 1);
            assert_eq!(report.closed, 0);
        }

        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Active);
        let tp = h.store.get_order(&link.tp_client_id).await.unwrap().unwrap();
        assert_eq!(tp.status, OrderStatus::Submitted);

        let reviews = h.store.list_reviews().await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].occurrences, 3);
        assert!(reviews[0].escalated);

        // Once the status maps again the review item is dropped
        h.mock.set_status(&link.tp_client_id, "NEW").await;
        h.reconciler.run_once().await.unwrap();
        assert!(h.store.list_reviews().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_entry_orphans_link() {
        let h = harness();
        let mut draft = bracket_draft("g1", "XYZUSDT", "s-1");
        draft.orders.entry.status = OrderStatus::Submitted;
        // None of the three orders exist on this exchange
        h.store.create_bracket(&draft).await.unwrap();

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.orphaned, 1);

        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Orphaned);
        let entry = h.store.get_order("g1-e").await.unwrap().unwrap();
        assert_eq!(entry.status, OrderStatus::Unknown);
    }

    #[tokio::test]
    async fn test_both_legs_cancelled_externally_orphans_link() {
        let h = harness();
        let link = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        h.mock.set_status(&link.tp_client_id, "CANCELED").await;
        h.mock.set_status(&link.sl_client_id, "EXPIRED").await;

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.updated, 2);
    }

    #[tokio::test]
    async fn test_one_leg_cancelled_keeps_link_active() {
        let h = harness();
        let link = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        h.mock.set_status(&link.tp_client_id, "CANCELED").await;

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.orphaned, 0);
        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Active);
    }

    #[tokio::test]
    async fn test_both_legs_triggered_closes_via_take_profit_and_flags() {
        let h = harness();
        let link = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        h.mock.set_status(&link.tp_client_id, "FINISHED").await;
        h.mock.set_status(&link.sl_client_id, "FINISHED").await;

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.closed, 1);

        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.closed_leg, Some(BracketLeg::TakeProfit));
        let reviews = h.store.list_reviews().await.unwrap();
        assert!(reviews.iter().any(|r| r.client_id == link.tp_client_id && r.escalated));
    }

    #[tokio::test]
    async fn test_transient_query_failure_is_isolated_per_link() {
        let h = harness();
        let bad = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        let good = seed_bracket(&h.store, &h.mock, "g2", "ABCUSDT").await;
        h.mock
            .fail_client(
                MockOp::Query,
                &bad.tp_client_id,
                ExchangeError::Transport("reset".into()),
                u32::MAX,
            )
            .await;
        h.mock.set_mark_price("ABCUSDT", dec!(0.56)).await;

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.polled, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.closed, 1);

        let stored = h.store.get_bracket(&good.group_id).await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
    }

    #[tokio::test]
    async fn test_closing_link_is_resumed_once_claim_is_stale() {
        let h = harness();
        let link = seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        h.store
            .begin_closing("g1", BracketLeg::TakeProfit, "other-instance")
            .await
            .unwrap();

        // Fresh claim: left to its owner
        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.closed, 0);
        assert_eq!(h.mock.cancel_calls(&link.sl_client_id).await, 0);

        h.store
            .execute_sql("UPDATE bracket_links SET closing_started_at = 0 WHERE group_id = 'g1'")
            .await
            .unwrap();

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.closed, 1);
        assert_eq!(h.mock.cancel_calls(&link.sl_client_id).await, 1);
    }

    #[tokio::test]
    async fn test_discrepancy_queue_is_persisted_with_fresh_status() {
        let h = harness();
        let draft = bracket_draft("g1", "XYZUSDT", "s-1");
        seed_bracket(&Store::open_in_memory().unwrap(), &h.mock, "g1", "XYZUSDT").await;
        h.mock.set_mark_price("XYZUSDT", dec!(0.56)).await;
        h.discrepancies.push(PendingWrite::Bracket(draft));

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert!(h.discrepancies.is_empty());
        // Recovered in this cycle, then closed by the poll that follows it
        assert_eq!(report.closed, 1);

        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
        assert_eq!(h.mock.order_count().await, 3);
    }

    #[tokio::test]
    async fn test_failed_recovery_is_requeued() {
        let h = harness();
        h.mock
            .fail_next(MockOp::Query, ExchangeError::Transport("down".into()), u32::MAX)
            .await;
        let draft = bracket_draft("g1", "XYZUSDT", "s-1");
        h.discrepancies.push(PendingWrite::Bracket(draft));

        let report = h.reconciler.run_once().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(h.discrepancies.len(), 1);
        assert!(h.store.get_bracket("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_service_runs_until_stopped() {
        let h = harness();
        seed_bracket(&h.store, &h.mock, "g1", "XYZUSDT").await;
        h.mock.set_mark_price("XYZUSDT", dec!(0.6)).await;

        let handle = Arc::new(h.reconciler).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let stored = h.store.get_bracket("g1").await.unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Closed);
    }
}
