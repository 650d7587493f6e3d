//! Strategy definitions as stored and scheduled.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-strategy sizing and protection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    #[serde(default = "default_leverage")]
    pub leverage: u8,
    /// Quote notional per entry before the decision's size multiplier
    pub order_notional: Decimal,
    /// Take-profit distance in percent of entry price (e.g. 10 = 10%)
    #[serde(default)]
    pub take_profit_pct: Option<Decimal>,
    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,
    /// Cap on absolute net position per symbol
    #[serde(default)]
    pub max_position_qty: Option<Decimal>,
}

fn default_leverage() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub id: String,
    /// Selects the decision provider
    pub kind: String,
    pub symbols: Vec<String>,
    /// Opaque decision parameters handed to the provider
    pub params: serde_json::Value,
    pub enabled: bool,
    pub interval_secs: u64,
    pub risk: RiskSettings,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Strategy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
