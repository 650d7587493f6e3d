//! Component wiring shared by the binary and integration tests.

use crate::bracket::ClosureHandler;
use crate::config::Config;
use crate::error::Result;
use crate::exchange::{ExchangeClient, ResilientExchange, TradingRulesCache};
use crate::persistence::Store;
use crate::reconcile::{DiscrepancyQueue, ReconciliationLoop};
use crate::strategy::{ProviderRegistry, StrategyScheduler, SubmissionPipeline};
use crate::utils::ServiceHandle;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// All long-lived components, built around one store and one exchange.
pub struct BracketKeeper {
    pub store: Store,
    pub exchange: ResilientExchange,
    pub rules: Arc<TradingRulesCache>,
    pub discrepancies: Arc<DiscrepancyQueue>,
    pub closure: Arc<ClosureHandler>,
    pub scheduler: Arc<StrategyScheduler>,
    pub reconciler: Arc<ReconciliationLoop>,
}

/// Running scheduler and reconciler.
pub struct KeeperHandles {
    pub scheduler: ServiceHandle,
    pub reconciler: ServiceHandle,
}

impl KeeperHandles {
    pub async fn stop(self) {
        self.scheduler.stop().await;
        self.reconciler.stop().await;
    }
}

impl BracketKeeper {
    pub fn new(
        config: &Config,
        store: Store,
        exchange: Arc<dyn ExchangeClient>,
        providers: ProviderRegistry,
    ) -> Self {
        let exchange =
            ResilientExchange::new(exchange, config.retry.policy(), config.retry.call_timeout());
        let rules = Arc::new(TradingRulesCache::new(
            Arc::new(exchange.clone()),
            Duration::from_secs(config.rules.ttl_secs),
        ));
        let discrepancies = Arc::new(DiscrepancyQueue::new());
        let closure = Arc::new(ClosureHandler::new(
            store.clone(),
            exchange.clone(),
            config.reconciliation.closing_takeover(),
        ));

        let pipeline = Arc::new(SubmissionPipeline::new(
            store.clone(),
            exchange.clone(),
            rules.clone(),
            discrepancies.clone(),
        ));
        let scheduler = Arc::new(StrategyScheduler::new(
            store.clone(),
            exchange.clone(),
            providers,
            pipeline,
            config.scheduler.clone(),
        ));
        let reconciler = Arc::new(ReconciliationLoop::new(
            store.clone(),
            exchange.clone(),
            closure.clone(),
            discrepancies.clone(),
            config.reconciliation.clone(),
        ));

        Self {
            store,
            exchange,
            rules,
            discrepancies,
            closure,
            scheduler,
            reconciler,
        }
    }

    /// Write the configured strategies into the store. Existing rows keep
    /// their last-run time.
    pub async fn seed_strategies(&self, config: &Config) -> Result<usize> {
        for seed in &config.strategies {
            self.store.upsert_strategy(&seed.to_strategy()).await?;
            info!(strategy_id = %seed.id, kind = %seed.kind, symbols = ?seed.symbols, "Strategy loaded");
        }
        Ok(config.strategies.len())
    }

    pub fn start(&self) -> KeeperHandles {
        KeeperHandles {
            reconciler: self.reconciler.clone().start(),
            scheduler: self.scheduler.clone().start(),
        }
    }
}
