//! Strategy run leases and the manual review queue.

use super::*;
use tracing::error;

/// An exchange status the reconciler could not map, awaiting a human.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub client_id: String,
    pub group_id: Option<String>,
    pub raw_status: String,
    pub occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub escalated: bool,
}

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewItem> {
    Ok(ReviewItem {
        client_id: row.get(0)?,
        group_id: row.get(1)?,
        raw_status: row.get(2)?,
        occurrences: row.get(3)?,
        first_seen: time_col(row, 4)?,
        last_seen: time_col(row, 5)?,
        escalated: row.get(6)?,
    })
}

impl Store {
    /// Take the run lease for a strategy unless a live one is held.
    ///
    /// An expired lease is taken over regardless of its holder.
    pub async fn try_acquire_lease(
        &self,
        strategy_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let strategy_id = strategy_id.to_string();
        let holder = holder.to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.write("try_acquire_lease", move |tx| {
            let now = Utc::now().timestamp_millis();
            let changed = tx.execute(
                r#"
                INSERT INTO strategy_leases (strategy_id, holder, acquired_at, expires_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(strategy_id) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE strategy_leases.expires_at <= excluded.acquired_at
                "#,
                params![strategy_id, holder, now, now.saturating_add(ttl_ms)],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Release a lease if `holder` still owns it.
    pub async fn release_lease(&self, strategy_id: &str, holder: &str) -> Result<bool, StoreError> {
        let strategy_id = strategy_id.to_string();
        let holder = holder.to_string();
        self.write("release_lease", move |tx| {
            let changed = tx.execute(
                "DELETE FROM strategy_leases WHERE strategy_id = ?1 AND holder = ?2",
                params![strategy_id, holder],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Count another sighting of an unmapped status. Returns the occurrence
    /// count and whether this sighting crossed the escalation threshold.
    pub async fn record_ambiguity(
        &self,
        client_id: &str,
        group_id: Option<&str>,
        raw_status: &str,
        threshold: u32,
    ) -> Result<(u32, bool), StoreError> {
        let key = client_id.to_string();
        let group_id = group_id.map(str::to_string);
        let status = raw_status.to_string();
        let (occurrences, escalated_now) = self
            .write("record_ambiguity", move |tx| {
                let now = Utc::now().to_rfc3339();
                tx.execute(
                    r#"
                    INSERT INTO review_queue (client_id, group_id, raw_status, occurrences,
                                              first_seen, last_seen, escalated)
                    VALUES (?1, ?2, ?3, 1, ?4, ?4, 0)
                    ON CONFLICT(client_id) DO UPDATE SET
                        raw_status = excluded.raw_status,
                        occurrences = review_queue.occurrences + 1,
                        last_seen = excluded.last_seen
                    "#,
                    params![key, group_id, status, now],
                )?;

                let (occurrences, escalated): (u32, bool) = tx.query_row(
                    "SELECT occurrences, escalated FROM review_queue WHERE client_id = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;

                if !escalated && occurrences >= threshold {
                    tx.execute(
                        "UPDATE review_queue SET escalated = 1 WHERE client_id = ?1",
                        params![key],
                    )?;
                    return Ok((occurrences, true));
                }
                Ok((occurrences, false))
            })
            .await?;

        if escalated_now {
            error!(
                %client_id,
                %raw_status,
                occurrences,
                "Unrecognized exchange status persists, escalated for manual review"
            );
        }
        Ok((occurrences, escalated_now))
    }

    /// Drop a review item once its status maps again.
    pub async fn clear_ambiguity(&self, client_id: &str) -> Result<bool, StoreError> {
        let client_id = client_id.to_string();
        self.write("clear_ambiguity", move |tx| {
            let changed = tx.execute(
                "DELETE FROM review_queue WHERE client_id = ?1",
                params![client_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Record an item that needs a human, escalated immediately.
    pub async fn flag_for_review(
        &self,
        client_id: &str,
        group_id: Option<&str>,
        note: &str,
    ) -> Result<(), StoreError> {
        let client_id = client_id.to_string();
        let group_id = group_id.map(str::to_string);
        let note = note.to_string();
        self.write("flag_for_review", move |tx| {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                r#"
                INSERT INTO review_queue (client_id, group_id, raw_status, occurrences,
                                          first_seen, last_seen, escalated)
                VALUES (?1, ?2, ?3, 1, ?4, ?4, 1)
                ON CONFLICT(client_id) DO UPDATE SET
                    raw_status = excluded.raw_status,
                    last_seen = excluded.last_seen,
                    escalated = 1
                "#,
                params![client_id, group_id, note, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_reviews(&self) -> Result<Vec<ReviewItem>, StoreError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT client_id, group_id, raw_status, occurrences, first_seen, last_seen,
                       escalated
                FROM review_queue
                ORDER BY escalated DESC, last_seen DESC
                "#,
            )?;
            let items = stmt
                .query_map([], review_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_excludes_second_holder() {
        let store = Store::open_in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("s-1", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("s-1", "b", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("s-1", "a", ttl).await.unwrap());

        // Only the holder can release
        assert!(!store.release_lease("s-1", "b").await.unwrap());
        assert!(store.release_lease("s-1", "a").await.unwrap());
        assert!(store.try_acquire_lease("s-1", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Store::open_in_memory().unwrap();

        assert!(store
            .try_acquire_lease("s-1", "crashed", Duration::ZERO)
            .await
            .unwrap());
        assert!(store
            .try_acquire_lease("s-1", "fresh", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store.release_lease("s-1", "crashed").await.unwrap());
    }

    #[tokio::test]
    async fn test_ambiguity_escalates_once_at_threshold() {
        let store = Store::open_in_memory().unwrap();

        let first = store.record_ambiguity("tp-1", Some("g1"), "WEIRD", 3).await.unwrap();
        assert_eq!(first, (1, false));
        store.record_ambiguity("tp-1", Some("g1"), "WEIRD", 3).await.unwrap();
        let third = store.record_ambiguity("tp-1", Some("g1"), "WEIRD", 3).await.unwrap();
        assert_eq!(third, (3, true));
        let fourth = store.record_ambiguity("tp-1", Some("g1"), "WEIRD", 3).await.unwrap();
        assert_eq!(fourth, (4, false));

        let reviews = store.list_reviews().await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert!(reviews[0].escalated);

        assert!(store.clear_ambiguity("tp-1").await.unwrap());
        assert!(store.list_reviews().await.unwrap().is_empty());
    }
}
