//! Decision providers: given a symbol and its market snapshot, say whether
//! to enter and how large.

use crate::error::{Error, Result};
use crate::exchange::{MarketSnapshot, OrderSide};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Buy,
    Sell,
    NoOp,
}

impl Action {
    /// Entry side, `None` for no-op.
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            Action::Buy => Some(OrderSide::Buy),
            Action::Sell => Some(OrderSide::Sell),
            Action::NoOp => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    /// Scales the strategy's order notional (1 = as configured)
    pub size_multiplier: Decimal,
}

impl Decision {
    pub fn no_op(reason: impl Into<String>) -> Self {
        Self {
            action: Action::NoOp,
            reason: reason.into(),
            size_multiplier: Decimal::ZERO,
        }
    }
}

/// Strategy-specific decision logic. Treated as pure: the scheduler bounds
/// its execution time and never retries it within a tick.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn evaluate(
        &self,
        symbol: &str,
        snapshot: &MarketSnapshot,
        params: &serde_json::Value,
    ) -> Result<Decision>;
}

/// Decision providers keyed by strategy kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DecisionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers shipped in this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(MomentumProvider::KIND, Arc::new(MomentumProvider));
        registry
    }

    pub fn register(&mut self, kind: &str, provider: Arc<dyn DecisionProvider>) {
        self.providers.insert(kind.to_string(), provider);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn DecisionProvider>> {
        self.providers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("decision provider {:?}", kind)))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[derive(Debug, Deserialize)]
struct MomentumParams {
    #[serde(default = "default_threshold_pct")]
    threshold_pct: Decimal,
    #[serde(default = "default_allow_short")]
    allow_short: bool,
    /// Multiplier applied once the move exceeds twice the threshold
    #[serde(default = "default_strong_multiplier")]
    strong_multiplier: Decimal,
}

fn default_threshold_pct() -> Decimal {
    dec!(2)
}

fn default_allow_short() -> bool {
    true
}

fn default_strong_multiplier() -> Decimal {
    Decimal::ONE
}

/// Follows the 24h move: buy above `threshold_pct`, sell below its negative.
#[derive(Debug, Clone, Copy, Default)]
pub struct MomentumProvider;

impl MomentumProvider {
    pub const KIND: &'static str = "momentum";
}

#[async_trait]
impl DecisionProvider for MomentumProvider {
    async fn evaluate(
        &self,
        _symbol: &str,
        snapshot: &MarketSnapshot,
        params: &serde_json::Value,
    ) -> Result<Decision> {
        let params: MomentumParams = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("momentum params: {}", e)))?;

        if params.threshold_pct <= Decimal::ZERO {
            return Err(Error::Validation(
                "momentum threshold_pct must be positive".to_string(),
            ));
        }

        let change = snapshot.price_change_pct;
        let magnitude = change.abs();
        let size_multiplier = if magnitude >= params.threshold_pct * dec!(2) {
            params.strong_multiplier
        } else {
            Decimal::ONE
        };

        let decision = if change >= params.threshold_pct {
            Decision {
                action: Action::Buy,
                reason: format!("24h change {}% >= {}%", change, params.threshold_pct),
                size_multiplier,
            }
        } else if change <= -params.threshold_pct && params.allow_short {
            Decision {
                action: Action::Sell,
                reason: format!("24h change {}% <= -{}%", change, params.threshold_pct),
                size_multiplier,
            }
        } else {
            Decision::no_op(format!("24h change {}% inside threshold", change))
        };

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn snapshot(change: Decimal) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "XYZUSDT".to_string(),
            last_price: dec!(0.5),
            price_change_pct: change,
            high_24h: dec!(0.6),
            low_24h: dec!(0.4),
            quote_volume_24h: dec!(1000000),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_momentum_follows_the_move() {
        let provider = MomentumProvider;
        let params = json!({"threshold_pct": "3"});

        let up = provider.evaluate("XYZUSDT", &snapshot(dec!(4)), &params).await.unwrap();
        assert_eq!(up.action, Action::Buy);
        assert_eq!(up.size_multiplier, Decimal::ONE);

        let down = provider.evaluate("XYZUSDT", &snapshot(dec!(-3)), &params).await.unwrap();
        assert_eq!(down.action, Action::Sell);

        let flat = provider.evaluate("XYZUSDT", &snapshot(dec!(1.5)), &params).await.unwrap();
        assert_eq!(flat.action, Action::NoOp);
    }

    #[tokio::test]
    async fn test_momentum_params() {
        let provider = MomentumProvider;

        let long_only = json!({"threshold_pct": 2, "allow_short": false, "strong_multiplier": "1.5"});
        let down = provider
            .evaluate("XYZUSDT", &snapshot(dec!(-10)), &long_only)
            .await
            .unwrap();
        assert_eq!(down.action, Action::NoOp);

        let strong = provider
            .evaluate("XYZUSDT", &snapshot(dec!(5)), &long_only)
            .await
            .unwrap();
        assert_eq!(strong.size_multiplier, dec!(1.5));

        let defaults = provider.evaluate("XYZUSDT", &snapshot(dec!(2)), &json!({})).await.unwrap();
        assert_eq!(defaults.action, Action::Buy);

        let invalid = provider
            .evaluate("XYZUSDT", &snapshot(dec!(5)), &json!({"threshold_pct": "-1"}))
            .await;
        assert!(matches!(invalid, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ProviderRegistry::with_defaults();
        assert!(registry.get("momentum").is_ok());
        assert!(matches!(registry.get("grid"), Err(Error::NotFound(_))));

        let mut mock = MockDecisionProvider::new();
        mock.expect_evaluate()
            .returning(|_, _, _| Ok(Decision::no_op("mocked")));
        registry.register("grid", Arc::new(mock));

        assert_eq!(registry.kinds(), vec!["grid", "momentum"]);
        let decision = registry
            .get("grid")
            .unwrap()
            .evaluate("XYZUSDT", &snapshot(dec!(0)), &json!({}))
            .await
            .unwrap();
        assert_eq!(decision.reason, "mocked");
    }
}
