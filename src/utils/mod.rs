//! Shared utilities: decimal sizing helpers, retry/backoff, service lifecycle.

pub mod decimal;
pub mod lifecycle;
pub mod retry;

pub use lifecycle::{shutdown_requested, ServiceHandle};
pub use retry::{retry_with_backoff, ExponentialBackoff, RetryPolicy};
