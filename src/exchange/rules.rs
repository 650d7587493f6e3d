//! Time-bounded cache of per-symbol trading rules.

use super::traits::ExchangeClient;
use super::types::TradingRules;
use crate::error::ExchangeError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

pub struct TradingRulesCache {
    exchange: Arc<dyn ExchangeClient>,
    ttl: Duration,
    entries: RwLock<HashMap<String, (TradingRules, Instant)>>,
}

impl TradingRulesCache {
    pub fn new(exchange: Arc<dyn ExchangeClient>, ttl: Duration) -> Self {
        Self {
            exchange,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached rules for `symbol`, fetched from the exchange when missing or stale.
    pub async fn get(&self, symbol: &str) -> Result<TradingRules, ExchangeError> {
        if let Some((rules, fetched_at)) = self.entries.read().await.get(symbol) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(rules.clone());
            }
        }
        self.refresh(symbol).await
    }

    pub async fn refresh(&self, symbol: &str) -> Result<TradingRules, ExchangeError> {
        let rules = self.exchange.trading_rules(symbol).await?;
        debug!(
            %symbol,
            step_size = %rules.step_size,
            tick_size = %rules.tick_size,
            min_notional = %rules.min_notional,
            "Trading rules refreshed"
        );
        self.entries
            .write()
            .await
            .insert(symbol.to_string(), (rules.clone(), Instant::now()));
        Ok(rules)
    }

    pub async fn invalidate(&self, symbol: &str) {
        self.entries.write().await.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockOp};

    #[tokio::test]
    async fn test_rules_are_cached_until_ttl() {
        let mock = Arc::new(MockExchange::new());
        let cache = TradingRulesCache::new(mock.clone(), Duration::from_secs(60));

        cache.get("XYZUSDT").await.unwrap();
        cache.get("XYZUSDT").await.unwrap();
        assert_eq!(mock.calls(MockOp::Rules, "XYZUSDT").await, 1);

        cache.invalidate("XYZUSDT").await;
        cache.get("XYZUSDT").await.unwrap();
        assert_eq!(mock.calls(MockOp::Rules, "XYZUSDT").await, 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_refetches() {
        let mock = Arc::new(MockExchange::new());
        let cache = TradingRulesCache::new(mock.clone(), Duration::ZERO);

        cache.get("XYZUSDT").await.unwrap();
        cache.get("XYZUSDT").await.unwrap();
        assert_eq!(mock.calls(MockOp::Rules, "XYZUSDT").await, 2);
    }
}
