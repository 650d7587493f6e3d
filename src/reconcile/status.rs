//! Exchange status normalization.
//!
//! Every raw status string goes through one exhaustive table. Anything the
//! table does not know maps to [`NormalizedStatus::Unknown`], never to a guess.

use crate::bracket::OrderStatus;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormalizedStatus {
    Open,
    Triggered,
    Cancelled,
    Rejected,
    Unknown,
}

impl NormalizedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizedStatus::Open => "open",
            NormalizedStatus::Triggered => "triggered",
            NormalizedStatus::Cancelled => "cancelled",
            NormalizedStatus::Rejected => "rejected",
            NormalizedStatus::Unknown => "unknown",
        }
    }

    /// Order row status for this normalized status. `Unknown` has none: the
    /// row keeps its status and the sighting goes to the review queue.
    pub fn order_status(&self) -> Option<OrderStatus> {
        match self {
            NormalizedStatus::Open => Some(OrderStatus::Submitted),
            NormalizedStatus::Triggered => Some(OrderStatus::Filled),
            NormalizedStatus::Cancelled => Some(OrderStatus::Cancelled),
            NormalizedStatus::Rejected => Some(OrderStatus::Failed),
            NormalizedStatus::Unknown => None,
        }
    }

    /// The leg will never execute.
    pub fn is_dead(&self) -> bool {
        matches!(self, NormalizedStatus::Cancelled | NormalizedStatus::Rejected)
    }
}

impl fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a raw exchange status. Case-insensitive, surrounding whitespace ignored.
pub fn normalize_status(raw: &str) -> NormalizedStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "NEW" | "PARTIALLY_FILLED" | "TRIGGERING" => NormalizedStatus::Open,
        "TRIGGERED" | "FILLED" | "FINISHED" | "SUCCESS" => NormalizedStatus::Triggered,
        "CANCELED" | "CANCELLED" | "EXPIRED" | "EXPIRED_IN_MATCH" => NormalizedStatus::Cancelled,
        "REJECTED" => NormalizedStatus::Rejected,
        _ => NormalizedStatus::Unknown,
    }
}
