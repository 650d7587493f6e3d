//! Reconciliation: polls open brackets, normalizes exchange statuses and
//! hands triggered legs to the closure handler.

mod discrepancy;
mod reconciler;
mod status;

pub use discrepancy::{DiscrepancyQueue, PendingWrite};
pub use reconciler::{CycleReport, ReconciliationLoop};
pub use status::{normalize_status, NormalizedStatus};
