//! Timeout and bounded-retry wrapper around any [`ExchangeClient`].
//!
//! Submissions are retried with the same client order id. If a retry comes
//! back as a duplicate, the first attempt reached the exchange and its ack
//! was lost, so the order is looked up instead of being reported as failed.

use super::traits::ExchangeClient;
use super::types::*;
use crate::error::ExchangeError;
use crate::utils::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ResilientExchange {
    inner: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl ResilientExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            call_timeout,
        }
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, ExchangeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let timeout = self.call_timeout;
        retry_with_backoff(&self.policy, operation, ExchangeError::is_transient, |attempt| {
            let fut = f(attempt);
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ExchangeError::Timeout(timeout)),
                }
            }
        })
        .await
    }

    /// Rebuild an acknowledgement for an order whose first ack was lost.
    async fn recover_ack(&self, leg: &LegRef) -> Result<OrderAck, ExchangeError> {
        let report = self.inner.query_status(leg).await?;
        info!(
            client_id = %leg.client_id,
            status = %report.status,
            "Duplicate on retry, recovered original order"
        );
        Ok(OrderAck {
            exchange_order_id: report.exchange_order_id.unwrap_or_default(),
            client_id: report.client_id,
            status: report.status,
            executed_qty: report.executed_qty.unwrap_or(Decimal::ZERO),
            avg_price: report.avg_price,
        })
    }
}

#[async_trait]
impl ExchangeClient for ResilientExchange {
    async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, ExchangeError> {
        let leg = &LegRef {
            symbol: order.symbol.clone(),
            client_id: order.new_client_order_id.clone(),
            conditional: false,
        };
        self.call("submit_order", |attempt| async move {
            match self.inner.submit_order(order).await {
                Err(ExchangeError::Duplicate(_)) if attempt > 1 => self.recover_ack(leg).await,
                other => other,
            }
        })
        .await
    }

    async fn submit_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> Result<OrderAck, ExchangeError> {
        let leg = &LegRef {
            symbol: order.symbol.clone(),
            client_id: order.client_algo_id.clone(),
            conditional: true,
        };
        self.call("submit_conditional_order", |attempt| async move {
            match self.inner.submit_conditional_order(order).await {
                Err(ExchangeError::Duplicate(_)) if attempt > 1 => self.recover_ack(leg).await,
                other => other,
            }
        })
        .await
    }

    async fn cancel_order(&self, leg: &LegRef) -> Result<(), ExchangeError> {
        self.call("cancel_order", |_| self.inner.cancel_order(leg)).await
    }

    async fn query_status(&self, leg: &LegRef) -> Result<OrderStatusReport, ExchangeError> {
        self.call("query_status", |_| self.inner.query_status(leg)).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError> {
        let result = self
            .call("set_leverage", |_| self.inner.set_leverage(symbol, leverage))
            .await;
        if let Err(e) = &result {
            warn!(%symbol, leverage, error = %e, "Failed to set leverage");
        }
        result
    }

    async fn trading_rules(&self, symbol: &str) -> Result<TradingRules, ExchangeError> {
        self.call("trading_rules", |_| self.inner.trading_rules(symbol)).await
    }

    async fn market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        self.call("market_snapshot", |_| self.inner.market_snapshot(symbol))
            .await
    }
}
