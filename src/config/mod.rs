//! Configuration management for bracket keeper.
//!
//! Loads settings from an optional `config.toml`, `.env` and `BRK__*`
//! environment variables (e.g. `BRK__BINANCE__API_KEY`).

use crate::strategy::{RiskSettings, Strategy};
use crate::utils::RetryPolicy;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Snapshot, rules, leverage, entry, two legs and a best-effort cancel.
const EXCHANGE_CALLS_PER_SYMBOL: u32 = 7;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Strategy scheduler timing and worker pool
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Reconciliation loop timing
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Exchange call timeout and retry budget
    #[serde(default)]
    pub retry: RetryConfig,
    /// SQLite store
    #[serde(default)]
    pub store: StoreConfig,
    /// Trading rules cache
    #[serde(default)]
    pub rules: RulesConfig,
    /// Strategies seeded into the store at startup
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often due strategies are looked for
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Worker pool size (concurrent strategy runs)
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Upper bound of the random delay added to each interval
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Must exceed the worst-case run duration
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Decision provider deadline; exceeding it counts as no-op
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Links polled concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches (rate-limit headroom)
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    /// Sightings of an unmapped status before escalation
    #[serde(default = "default_review_threshold")]
    pub review_threshold: u32,
    /// Age after which another instance may finish a `closing` link
    #[serde(default = "default_closing_takeover_secs")]
    pub closing_takeover_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per exchange call, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay (0.0-1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Deadline for a single exchange call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Attempts per write transaction on busy/locked conflicts
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rules_ttl_secs")]
    pub ttl_secs: u64,
}

/// Strategy definition as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub kind: String,
    pub symbols: Vec<String>,
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_strategy_interval_secs")]
    pub interval_secs: u64,
    pub risk: RiskSettings,
}

// Default value functions
fn default_recv_window_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_jitter_ms() -> u64 {
    2000
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_decision_timeout_ms() -> u64 {
    5000
}

fn default_reconcile_interval_secs() -> u64 {
    15
}

fn default_batch_size() -> usize {
    20
}

fn default_batch_pause_ms() -> u64 {
    200
}

fn default_review_threshold() -> u32 {
    5
}

fn default_closing_takeover_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_store_path() -> String {
    "bracket_keeper.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_write_retries() -> u32 {
    5
}

fn default_rules_ttl_secs() -> u64 {
    3600
}

fn default_params() -> serde_json::Value {
    serde_json::json!({})
}

fn default_enabled() -> bool {
    true
}

fn default_strategy_interval_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BRK"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scheduler.max_concurrent_runs >= 1,
            "scheduler.max_concurrent_runs must be at least 1"
        );

        anyhow::ensure!(
            self.scheduler.lease_ttl() > self.scheduler.decision_timeout(),
            "scheduler.lease_ttl_secs must exceed the decision timeout"
        );

        // Cancel plus status lookup of the sibling, each with full retries
        anyhow::ensure!(
            self.reconciliation.closing_takeover() > self.retry.worst_case_call().saturating_mul(2),
            "reconciliation.closing_takeover_secs must exceed two exchange calls with all retries ({:?})",
            self.retry.worst_case_call().saturating_mul(2)
        );

        anyhow::ensure!(
            self.reconciliation.batch_size >= 1,
            "reconciliation.batch_size must be at least 1"
        );

        anyhow::ensure!(
            self.retry.max_attempts >= 1,
            "retry.max_attempts must be at least 1"
        );

        anyhow::ensure!(
            (0.0..=1.0).contains(&self.retry.jitter_factor),
            "retry.jitter_factor must be between 0 and 1"
        );

        for strategy in &self.strategies {
            strategy
                .validate()
                .with_context(|| format!("Invalid strategy {}", strategy.id))?;
        }

        for (strategy_id, worst_case) in self.lease_shortfalls() {
            warn!(
                %strategy_id,
                lease_ttl_secs = self.scheduler.lease_ttl_secs,
                worst_case_secs = worst_case.as_secs(),
                "Lease TTL is shorter than the worst-case run; an overrunning run may overlap the next one"
            );
        }

        Ok(())
    }

    /// Upper bound of one run over `symbols` symbols: every symbol times out
    /// its decision and exhausts the retry budget on each exchange call.
    pub fn worst_case_run(&self, symbols: usize) -> Duration {
        let per_symbol = self.scheduler.decision_timeout().saturating_add(
            self.retry
                .worst_case_call()
                .saturating_mul(EXCHANGE_CALLS_PER_SYMBOL),
        );
        per_symbol.saturating_mul(u32::try_from(symbols).unwrap_or(u32::MAX))
    }

    /// Seeded strategies whose worst-case run outlasts the lease TTL.
    pub fn lease_shortfalls(&self) -> Vec<(String, Duration)> {
        self.strategies
            .iter()
            .map(|s| (s.id.clone(), self.worst_case_run(s.symbols.len())))
            .filter(|(_, worst_case)| *worst_case >= self.scheduler.lease_ttl())
            .collect()
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

impl ReconciliationConfig {
    pub fn closing_takeover(&self) -> Duration {
        Duration::from_secs(self.closing_takeover_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_factor: self.jitter_factor,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// One exchange call that times out on every attempt and waits the
    /// longest backoff between attempts.
    pub fn worst_case_call(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let stretched = Duration::from_millis(self.max_delay_ms).as_secs_f64()
            * (1.0 + self.jitter_factor.clamp(0.0, 1.0));
        let longest_pause = Duration::try_from_secs_f64(stretched).unwrap_or(Duration::MAX);
        self.call_timeout()
            .saturating_mul(attempts)
            .saturating_add(longest_pause.saturating_mul(attempts - 1))
    }
}

impl StoreConfig {
    pub fn write_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.write_retries.max(1),
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(500),
            jitter_factor: 0.5,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.symbols.is_empty(), "at least one symbol is required");
        anyhow::ensure!(self.interval_secs >= 1, "interval_secs must be at least 1");
        anyhow::ensure!(
            self.risk.order_notional > Decimal::ZERO,
            "risk.order_notional must be positive"
        );
        anyhow::ensure!(self.risk.leverage >= 1, "risk.leverage must be at least 1");
        Ok(())
    }

    pub fn to_strategy(&self) -> Strategy {
        Strategy {
            id: self.id.clone(),
            kind: self.kind.clone(),
            symbols: self.symbols.clone(),
            params: self.params.clone(),
            enabled: self.enabled,
            interval_secs: self.interval_secs,
            risk: self.risk.clone(),
            last_run_at: None,
        }
    }
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            recv_window_ms: default_recv_window_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_runs: default_max_concurrent_runs(),
            jitter_ms: default_jitter_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            decision_timeout_ms: default_decision_timeout_ms(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            review_threshold: default_review_threshold(),
            closing_takeover_secs: default_closing_takeover_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            write_retries: default_write_retries(),
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_rules_ttl_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn strategy_config() -> StrategyConfig {
        StrategyConfig {
            id: "momo".to_string(),
            kind: "momentum".to_string(),
            symbols: vec!["XYZUSDT".to_string()],
            params: default_params(),
            enabled: true,
            interval_secs: 60,
            risk: RiskSettings {
                leverage: 2,
                order_notional: dec!(50),
                take_profit_pct: Some(dec!(10)),
                stop_loss_pct: Some(dec!(5)),
                max_position_qty: None,
            },
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.policy().max_attempts, 3);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let mut config = Config::default();
        let mut strategy = strategy_config();
        strategy.risk.order_notional = Decimal::ZERO;
        config.strategies.push(strategy);

        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("order_notional"));
    }

    #[test]
    fn test_huge_lease_ttl_does_not_overflow() {
        let mut config = Config::default();
        config.scheduler.lease_ttl_secs = u64::MAX;
        config.retry.call_timeout_ms = u64::MAX;
        config.reconciliation.closing_takeover_secs = u64::MAX;

        // Saturated budgets still compare instead of panicking
        let _ = config.validate();
        assert_eq!(config.worst_case_run(usize::MAX), Duration::MAX);
    }

    #[test]
    fn test_worst_case_call_counts_timeouts_and_backoff() {
        let config = Config::default();
        // 3 attempts x 10s plus 2 pauses of 5s stretched by 20% jitter
        assert_eq!(config.retry.worst_case_call(), Duration::from_secs(42));
        assert_eq!(config.worst_case_run(1), Duration::from_secs(5 + 7 * 42));
    }

    #[test]
    fn test_lease_shorter_than_worst_case_run_is_reported() {
        let mut config = Config::default();
        config.strategies.push(strategy_config());
        assert!(config.lease_shortfalls().is_empty());

        let mut wide = strategy_config();
        wide.id = "wide".to_string();
        wide.symbols = vec!["XYZUSDT".to_string(), "ABCUSDT".to_string()];
        config.strategies.push(wide);

        // Too short a lease is a warning, not a startup failure
        assert!(config.validate().is_ok());
        let shortfalls = config.lease_shortfalls();
        assert_eq!(shortfalls.len(), 1);
        assert_eq!(shortfalls[0].0, "wide");
        assert_eq!(shortfalls[0].1, Duration::from_secs(2 * (5 + 7 * 42)));
    }

    #[test]
    fn test_closing_takeover_must_outlast_a_cancel() {
        let mut config = Config::default();
        config.reconciliation.closing_takeover_secs = 60;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("closing_takeover_secs"));

        config.reconciliation.closing_takeover_secs = 90;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strategy_config_from_toml() {
        let raw = r#"
            [[strategies]]
            id = "momo"
            kind = "momentum"
            symbols = ["XYZUSDT", "ABCUSDT"]
            interval_secs = 120

            [strategies.params]
            threshold_pct = "3"

            [strategies.risk]
            order_notional = "25"
            take_profit_pct = "8"
            stop_loss_pct = "4"
        "#;

        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.validate().is_ok());
        let strategy = config.strategies[0].to_strategy();
        assert_eq!(strategy.symbols.len(), 2);
        assert_eq!(strategy.risk.leverage, 1);
        assert_eq!(strategy.risk.order_notional, dec!(25));
        assert_eq!(strategy.params["threshold_pct"], "3");
        assert!(strategy.enabled);
    }
}
