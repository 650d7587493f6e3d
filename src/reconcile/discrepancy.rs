//! Orders the exchange accepted but the store failed to record.

use crate::bracket::{BracketDraft, ScheduledOrder};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// A write the submission pipeline could not commit.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Bracket(BracketDraft),
    /// Plain entry without protective legs
    Order(ScheduledOrder),
}

impl PendingWrite {
    pub fn symbol(&self) -> &str {
        match self {
            PendingWrite::Bracket(draft) => &draft.link.symbol,
            PendingWrite::Order(order) => &order.symbol,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            PendingWrite::Bracket(draft) => &draft.link.group_id,
            PendingWrite::Order(order) => &order.client_order_id,
        }
    }
}

/// Hand-off from the pipeline to the reconciler. Nothing here is ever
/// re-submitted to the exchange, only re-inserted into the store.
#[derive(Debug, Default)]
pub struct DiscrepancyQueue {
    items: Mutex<VecDeque<PendingWrite>>,
}

impl DiscrepancyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<PendingWrite>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: PendingWrite) {
        warn!(
            key = %item.key(),
            symbol = %item.symbol(),
            "Accepted order not persisted, queued for reconciliation"
        );
        self.items().push_back(item);
    }

    pub fn drain(&self) -> Vec<PendingWrite> {
        self.items().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::bracket_draft;

    #[test]
    fn test_drain_empties_queue_in_order() {
        let queue = DiscrepancyQueue::new();
        queue.push(PendingWrite::Bracket(bracket_draft("g1", "XYZUSDT", "s-1")));
        queue.push(PendingWrite::Order(bracket_draft("g2", "ABCUSDT", "s-1").orders.entry));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert!(queue.is_empty());
        assert_eq!(drained[0].key(), "g1");
        assert_eq!(drained[1].key(), "g2-e");
        assert_eq!(drained[1].symbol(), "ABCUSDT");
    }
}
