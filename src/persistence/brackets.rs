//! Scheduled orders and bracket links.

use super::*;
use crate::bracket::{
    BracketDraft, BracketLeg, BracketLink, BracketOrders, BracketStatus, OrderKind, OrderStatus,
    OrderUpdate, Position, ScheduledOrder,
};
use crate::exchange::OrderSide;
use tracing::warn;

const SELECT_ORDER: &str = r#"
    SELECT id, strategy_id, group_id, symbol, side, kind, quantity, price, client_order_id,
           exchange_order_id, status, executed_qty, avg_price, parent_order_id, trigger_time,
           created_at
    FROM scheduled_orders
"#;

const SELECT_LINK: &str = r#"
    SELECT group_id, strategy_id, symbol, entry_client_id, tp_client_id, sl_client_id, status,
           closed_leg, close_reason, sibling_cancel_error, created_at, closed_at
    FROM bracket_links
"#;

/// Outcome of the sibling cancellation recorded when a closure completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosureRecord {
    pub closed_at: DateTime<Utc>,
    pub reason: String,
    pub sibling_cancelled: bool,
    pub sibling_cancel_error: Option<String>,
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledOrder> {
    Ok(ScheduledOrder {
        id: Some(row.get(0)?),
        strategy_id: row.get(1)?,
        group_id: row.get(2)?,
        symbol: row.get(3)?,
        side: enum_col(row, 4, OrderSide::parse)?,
        kind: enum_col(row, 5, OrderKind::parse)?,
        quantity: decimal_col(row, 6)?,
        price: opt_decimal_col(row, 7)?,
        client_order_id: row.get(8)?,
        exchange_order_id: row.get(9)?,
        status: enum_col(row, 10, OrderStatus::parse)?,
        executed_qty: decimal_col(row, 11)?,
        avg_price: opt_decimal_col(row, 12)?,
        parent_order_id: row.get(13)?,
        trigger_time: opt_time_col(row, 14)?,
        created_at: time_col(row, 15)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<BracketLink> {
    let closed_leg: Option<String> = row.get(7)?;
    let closed_leg = closed_leg
        .map(|s| BracketLeg::parse(&s).ok_or_else(|| conversion_error(7, format!("bad leg {:?}", s))))
        .transpose()?;

    Ok(BracketLink {
        group_id: row.get(0)?,
        strategy_id: row.get(1)?,
        symbol: row.get(2)?,
        entry_client_id: row.get(3)?,
        tp_client_id: row.get(4)?,
        sl_client_id: row.get(5)?,
        status: enum_col(row, 6, BracketStatus::parse)?,
        closed_leg,
        close_reason: row.get(8)?,
        sibling_cancel_error: row.get(9)?,
        created_at: time_col(row, 10)?,
        closed_at: opt_time_col(row, 11)?,
    })
}

fn insert_order_row(
    tx: &Transaction<'_>,
    order: &ScheduledOrder,
    parent_order_id: Option<i64>,
) -> Result<i64, StoreError> {
    tx.execute(
        r#"
        INSERT INTO scheduled_orders (strategy_id, group_id, symbol, side, kind, quantity, price,
                                      client_order_id, exchange_order_id, status, executed_qty,
                                      avg_price, parent_order_id, trigger_time, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        params![
            order.strategy_id,
            order.group_id,
            order.symbol,
            order.side.as_str(),
            order.kind.as_str(),
            order.quantity.to_string(),
            opt_decimal_sql(order.price),
            order.client_order_id,
            order.exchange_order_id,
            order.status.as_str(),
            order.executed_qty.to_string(),
            opt_decimal_sql(order.avg_price),
            parent_order_id,
            opt_time_sql(order.trigger_time),
            order.created_at.to_rfc3339(),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn load_link(conn: &Connection, group_id: &str) -> Result<Option<BracketLink>, StoreError> {
    conn.query_row(
        &format!("{} WHERE group_id = ?1", SELECT_LINK),
        params![group_id],
        link_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn load_order(conn: &Connection, client_id: &str) -> Result<Option<ScheduledOrder>, StoreError> {
    conn.query_row(
        &format!("{} WHERE client_order_id = ?1", SELECT_ORDER),
        params![client_id],
        order_from_row,
    )
    .optional()
    .map_err(StoreError::from)
}

fn load_bracket_orders(
    conn: &Connection,
    link: &BracketLink,
) -> Result<Option<BracketOrders>, StoreError> {
    let entry = load_order(conn, &link.entry_client_id)?;
    let take_profit = load_order(conn, &link.tp_client_id)?;
    let stop_loss = load_order(conn, &link.sl_client_id)?;

    match (entry, take_profit, stop_loss) {
        (Some(entry), Some(take_profit), Some(stop_loss)) => Ok(Some(BracketOrders {
            entry,
            take_profit,
            stop_loss,
        })),
        (None, None, None) => Ok(None),
        _ => Err(StoreError::Corrupt(format!(
            "bracket {} is missing order rows",
            link.group_id
        ))),
    }
}

/// Update one order's status if the move is monotonic. Returns whether the
/// status changed.
fn update_order_status(
    conn: &Connection,
    client_id: &str,
    update: &OrderUpdate,
) -> Result<bool, StoreError> {
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM scheduled_orders WHERE client_order_id = ?1",
            params![client_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(current) = current else {
        return Ok(false);
    };
    let current = OrderStatus::parse(&current)
        .ok_or_else(|| StoreError::Corrupt(format!("order {} has status {:?}", client_id, current)))?;

    if current == update.status {
        // Same stage: only refresh fill details
        conn.execute(
            r#"
            UPDATE scheduled_orders SET
                executed_qty = COALESCE(?2, executed_qty),
                avg_price = COALESCE(?3, avg_price),
                exchange_order_id = COALESCE(?4, exchange_order_id)
            WHERE client_order_id = ?1
            "#,
            params![
                client_id,
                opt_decimal_sql(update.executed_qty),
                opt_decimal_sql(update.avg_price),
                update.exchange_order_id,
            ],
        )?;
        return Ok(false);
    }

    if !current.can_transition_to(update.status) {
        debug!(
            %client_id,
            from = %current,
            to = %update.status,
            "Ignoring non-monotonic status update"
        );
        return Ok(false);
    }

    conn.execute(
        r#"
        UPDATE scheduled_orders SET
            status = ?2,
            executed_qty = COALESCE(?3, executed_qty),
            avg_price = COALESCE(?4, avg_price),
            exchange_order_id = COALESCE(?5, exchange_order_id),
            trigger_time = COALESCE(?6, trigger_time)
        WHERE client_order_id = ?1
        "#,
        params![
            client_id,
            update.status.as_str(),
            opt_decimal_sql(update.executed_qty),
            opt_decimal_sql(update.avg_price),
            update.exchange_order_id,
            opt_time_sql(update.trigger_time),
        ],
    )?;
    Ok(true)
}

impl Store {
    /// Insert a bracket link and its three orders in one transaction.
    ///
    /// Idempotent on group id: re-inserting an existing bracket returns the
    /// stored rows unchanged.
    pub async fn create_bracket(&self, draft: &BracketDraft) -> Result<BracketOrders, StoreError> {
        let pending = draft.clone();
        let orders = self
            .write("create_bracket", move |tx| {
                let link = &pending.link;
                if load_link(tx, &link.group_id)?.is_some() {
                    return load_bracket_orders(tx, link)?.ok_or_else(|| {
                        StoreError::Corrupt(format!("bracket {} has no orders", link.group_id))
                    });
                }

                // Link row first, then orders in ascending id order
                tx.execute(
                    r#"
                    INSERT INTO bracket_links (group_id, strategy_id, symbol, entry_client_id,
                                               tp_client_id, sl_client_id, status, closed_leg,
                                               close_reason, sibling_cancel_error, created_at,
                                               closed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                    params![
                        link.group_id,
                        link.strategy_id,
                        link.symbol,
                        link.entry_client_id,
                        link.tp_client_id,
                        link.sl_client_id,
                        link.status.as_str(),
                        link.closed_leg.map(|l| l.as_str()),
                        link.close_reason,
                        link.sibling_cancel_error,
                        link.created_at.to_rfc3339(),
                        opt_time_sql(link.closed_at),
                    ],
                )?;

                let mut orders = pending.orders.clone();
                let entry_id = insert_order_row(tx, &orders.entry, None)?;
                orders.entry.id = Some(entry_id);

                for leg in [BracketLeg::TakeProfit, BracketLeg::StopLoss] {
                    let order = orders.leg_mut(leg);
                    order.parent_order_id = Some(entry_id);
                    order.id = Some(insert_order_row(tx, order, Some(entry_id))?);
                }

                Ok(orders)
            })
            .await?;

        info!(
            group_id = %draft.link.group_id,
            symbol = %draft.link.symbol,
            status = %draft.link.status,
            "Bracket persisted"
        );
        Ok(orders)
    }

    /// Persist a standalone order (entry without protective legs).
    pub async fn insert_order(&self, order: &ScheduledOrder) -> Result<i64, StoreError> {
        let order = order.clone();
        self.write("insert_order", move |tx| {
            insert_order_row(tx, &order, order.parent_order_id)
        })
        .await
    }

    pub async fn get_order(&self, client_id: &str) -> Result<Option<ScheduledOrder>, StoreError> {
        let client_id = client_id.to_string();
        self.read(move |conn| load_order(conn, &client_id)).await
    }

    pub async fn get_bracket(&self, group_id: &str) -> Result<Option<BracketLink>, StoreError> {
        let group_id = group_id.to_string();
        self.read(move |conn| load_link(conn, &group_id)).await
    }

    /// Entry, TP and SL rows of a bracket.
    pub async fn bracket_orders(&self, group_id: &str) -> Result<Option<BracketOrders>, StoreError> {
        let group_id = group_id.to_string();
        self.read(move |conn| match load_link(conn, &group_id)? {
            Some(link) => load_bracket_orders(conn, &link),
            None => Ok(None),
        })
        .await
    }

    /// Links the reconciler still has to poll (`active` or `closing`).
    pub async fn list_open_brackets(&self) -> Result<Vec<BracketLink>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE status IN ('active', 'closing') ORDER BY created_at, group_id",
                SELECT_LINK
            ))?;
            let links = stmt
                .query_map([], link_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(links)
        })
        .await
    }

    /// Most recent links regardless of status.
    pub async fn list_brackets(&self, limit: usize) -> Result<Vec<BracketLink>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} ORDER BY created_at DESC, group_id LIMIT ?1",
                SELECT_LINK
            ))?;
            let links = stmt
                .query_map(params![limit as i64], link_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(links)
        })
        .await
    }

    pub async fn count_brackets_by_status(&self) -> Result<Vec<(BracketStatus, i64)>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM bracket_links GROUP BY status ORDER BY status",
            )?;
            let counts = stmt
                .query_map([], |row| Ok((enum_col(row, 0, BracketStatus::parse)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(counts)
        })
        .await
    }

    /// `active → closing` compare-and-set. `owner` holds the closing claim
    /// from now on. Returns false if another caller already moved the link.
    pub async fn begin_closing(
        &self,
        group_id: &str,
        leg: BracketLeg,
        owner: &str,
    ) -> Result<bool, StoreError> {
        let group_id = group_id.to_string();
        let owner = owner.to_string();
        self.write("begin_closing", move |tx| {
            let changed = tx.execute(
                "UPDATE bracket_links SET status = 'closing', closed_leg = ?2,
                        closing_owner = ?3, closing_started_at = ?4
                 WHERE group_id = ?1 AND status = 'active'",
                params![group_id, leg.as_str(), owner, Utc::now().timestamp_millis()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Take over the closing claim of a `closing` link whose claim is older
    /// than `stale_after` (or was never recorded). Returns false while
    /// another owner's claim is fresh.
    pub async fn take_over_closing(
        &self,
        group_id: &str,
        owner: &str,
        stale_after: Duration,
    ) -> Result<bool, StoreError> {
        let group_id = group_id.to_string();
        let owner = owner.to_string();
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        self.write("take_over_closing", move |tx| {
            let now = Utc::now().timestamp_millis();
            let changed = tx.execute(
                "UPDATE bracket_links SET closing_owner = ?2, closing_started_at = ?3
                 WHERE group_id = ?1 AND status = 'closing'
                   AND (closing_started_at IS NULL OR closing_started_at <= ?4)",
                params![group_id, owner, now, now.saturating_sub(stale_ms)],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// `closing → closed` compare-and-set for the claim holder, recording the
    /// sibling outcome and settling the leg statuses in the same transaction.
    pub async fn finish_closing(
        &self,
        group_id: &str,
        owner: &str,
        record: &ClosureRecord,
    ) -> Result<bool, StoreError> {
        let group_id = group_id.to_string();
        let owner = owner.to_string();
        let record = record.clone();
        self.write("finish_closing", move |tx| {
            let changed = tx.execute(
                r#"
                UPDATE bracket_links SET
                    status = 'closed',
                    close_reason = ?2,
                    sibling_cancel_error = ?3,
                    closed_at = ?4,
                    closing_owner = NULL,
                    closing_started_at = NULL
                WHERE group_id = ?1 AND status = 'closing' AND closing_owner = ?5
                "#,
                params![
                    group_id,
                    record.reason,
                    record.sibling_cancel_error,
                    record.closed_at.to_rfc3339(),
                    owner,
                ],
            )?;
            if changed == 0 {
                return Ok(false);
            }

            let link = load_link(tx, &group_id)?
                .ok_or_else(|| StoreError::Corrupt(format!("bracket {} vanished", group_id)))?;
            let leg = link.closed_leg.ok_or_else(|| {
                StoreError::Corrupt(format!("closing bracket {} has no leg", group_id))
            })?;

            // TP rows precede SL rows, so ascending id order is tp, sl
            for candidate in [BracketLeg::TakeProfit, BracketLeg::StopLoss] {
                let client_id = link.leg_client_id(candidate);
                if candidate == leg {
                    let mut update = OrderUpdate::status(OrderStatus::Filled);
                    update.trigger_time = Some(record.closed_at);
                    update_order_status(tx, client_id, &update)?;
                } else if record.sibling_cancelled {
                    update_order_status(tx, client_id, &OrderUpdate::status(OrderStatus::Cancelled))?;
                }
            }
            Ok(true)
        })
        .await
    }

    /// `active → orphaned` compare-and-set.
    pub async fn mark_orphaned(
        &self,
        group_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let group_id = group_id.to_string();
        let reason = reason.to_string();
        self.write("mark_orphaned", move |tx| {
            let changed = tx.execute(
                "UPDATE bracket_links SET status = 'orphaned', close_reason = ?2, closed_at = ?3
                 WHERE group_id = ?1 AND status = 'active'",
                params![group_id, reason, at.to_rfc3339()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Apply an observed status change. Returns whether the status moved;
    /// regressions are ignored.
    pub async fn apply_order_update(
        &self,
        client_id: &str,
        update: &OrderUpdate,
    ) -> Result<bool, StoreError> {
        let client_id = client_id.to_string();
        let update = update.clone();
        self.write("apply_order_update", move |tx| {
            update_order_status(tx, &client_id, &update)
        })
        .await
    }

    /// Net position for a symbol from filled orders, in fill order.
    pub async fn net_position(&self, symbol: &str) -> Result<Position, StoreError> {
        let symbol = symbol.to_string();
        self.read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE symbol = ?1 AND status = 'filled' ORDER BY id",
                SELECT_ORDER
            ))?;
            let fills = stmt
                .query_map(params![symbol], order_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut net_qty = Decimal::ZERO;
            let mut avg_cost = Decimal::ZERO;

            for fill in fills {
                let qty = if fill.executed_qty > Decimal::ZERO {
                    fill.executed_qty
                } else {
                    fill.quantity
                };
                let signed = match fill.side {
                    OrderSide::Buy => qty,
                    OrderSide::Sell => -qty,
                };
                let Some(price) = fill.avg_price.or(fill.price) else {
                    warn!(client_id = %fill.client_order_id, "Filled order without price");
                    net_qty += signed;
                    continue;
                };

                let same_direction = net_qty.is_zero() || (net_qty > Decimal::ZERO) == (signed > Decimal::ZERO);
                let next = net_qty + signed;
                if same_direction {
                    avg_cost = crate::utils::decimal::weighted_average(&[
                        (avg_cost, net_qty.abs()),
                        (price, qty),
                    ]);
                } else if next.is_zero() {
                    avg_cost = Decimal::ZERO;
                } else if (next > Decimal::ZERO) != (net_qty > Decimal::ZERO) {
                    // Flipped through zero
                    avg_cost = price;
                }
                net_qty = next;
            }

            Ok(Position {
                symbol,
                net_qty,
                avg_cost,
            })
        })
        .await
    }
}
