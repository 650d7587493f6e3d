//! Error taxonomy for the bracket lifecycle core.
//!
//! Exchange failures are first classified as [`ExchangeError`] by the
//! client implementations and then folded into [`Error`], which is what the
//! scheduler, pipeline and reconciler propagate.

use std::time::Duration;
use thiserror::Error;

use crate::persistence::StoreError;

/// Result alias used across the core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Raw failure reported by an exchange client.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// The call did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Request weight or order rate limit exceeded.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Connection, DNS, TLS or 5xx failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Permanent refusal (insufficient margin, invalid quantity, ...).
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// The exchange has no record of the order.
    #[error("order not found: {0}")]
    NotFound(String),

    /// A client order id was reused; the original order exists.
    #[error("duplicate client order id: {0}")]
    Duplicate(String),

    /// Response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::RateLimited(_) | ExchangeError::Transport(_)
        )
    }
}

/// Core error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed strategy parameters or computed order sizing. Not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Timeout, rate limit or connection failure that outlived its retries.
    #[error("transient exchange failure: {0}")]
    ExchangeTransient(ExchangeError),

    /// Permanent exchange-side refusal. Not retried.
    #[error("exchange rejection: {0}")]
    ExchangeRejection(ExchangeError),

    /// Store write conflict or unavailability after bounded retries.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// Exchange reported a status outside the mapping table.
    #[error("unrecognized exchange status {status:?} for {client_id}")]
    ReconciliationAmbiguity { client_id: String, status: String },

    /// Unknown strategy id or decision provider kind.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<ExchangeError> for Error {
    fn from(err: ExchangeError) -> Self {
        if err.is_transient() {
            Error::ExchangeTransient(err)
        } else {
            Error::ExchangeRejection(err)
        }
    }
}

impl Error {
    /// Short machine-friendly label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::ExchangeTransient(_) => "exchange_transient",
            Error::ExchangeRejection(_) => "exchange_rejection",
            Error::Persistence(_) => "persistence",
            Error::ReconciliationAmbiguity { .. } => "reconciliation_ambiguity",
            Error::NotFound(_) => "not_found",
        }
    }
}
