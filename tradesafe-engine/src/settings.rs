//! Configuration loading
//!
//! Layered settings in the usual order: baked-in defaults, an optional
//! `tradesafe` config file, then `TRADESAFE_`-prefixed environment
//! variables. The loaded settings materialize into the per-component
//! config structs.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::EngineError;
use crate::lifecycle::LifecycleConfig;
use crate::outbox::NotificationConfig;
use crate::provider::ProviderConfig;
use crate::settlement::SettlementConfig;
use crate::timers::TimerConfig;
use crate::EngineResult;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub currency: String,
    pub max_order_total_cents: i64,
    pub dispute_window_hours: i64,
    pub stale_after_hours: i64,
    pub notification_dedup_secs: i64,
    pub owner_rate_bps: i64,
    pub owner_rate_referred_bps: i64,
    pub referrer_rate_bps: i64,
    /// When unset the deterministic dev stub provider is used
    pub provider_base_url: Option<String>,
    pub provider_timeout_secs: u64,
    pub admin_token: String,
}

impl Settings {
    pub fn load() -> EngineResult<Self> {
        Self::build().map_err(|e| EngineError::config(e.to_string()))
    }

    fn build() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("currency", "USD")?
            .set_default("max_order_total_cents", 10_000_000_i64)?
            .set_default("dispute_window_hours", 48_i64)?
            .set_default("stale_after_hours", 24_i64)?
            .set_default("notification_dedup_secs", 2_i64)?
            .set_default("owner_rate_bps", 1_000_i64)?
            .set_default("owner_rate_referred_bps", 700_i64)?
            .set_default("referrer_rate_bps", 300_i64)?
            .set_default("provider_timeout_secs", 10_i64)?
            .set_default("admin_token", "dev-admin-token")?
            .add_source(File::with_name("tradesafe").required(false))
            .add_source(Environment::with_prefix("TRADESAFE"))
            .build()?
            .try_deserialize()
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            currency: self.currency.clone(),
            provider_call_timeout_secs: self.provider_timeout_secs,
            max_order_total_cents: self.max_order_total_cents,
        }
    }

    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig {
            dispute_window_hours: self.dispute_window_hours,
            stale_after_hours: self.stale_after_hours,
        }
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            owner_rate_bps: self.owner_rate_bps,
            owner_rate_referred_bps: self.owner_rate_referred_bps,
            referrer_rate_bps: self.referrer_rate_bps,
        }
    }

    pub fn notification_config(&self) -> NotificationConfig {
        NotificationConfig {
            dedup_window_secs: self.notification_dedup_secs,
        }
    }

    /// Provider config when a real provider is wired; None means dev stub
    pub fn provider_config(&self) -> Option<ProviderConfig> {
        self.provider_base_url.as_ref().map(|url| ProviderConfig {
            base_url: url.clone(),
            request_timeout_secs: self.provider_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.currency, "USD");
        assert_eq!(settings.dispute_window_hours, 48);
        assert_eq!(settings.stale_after_hours, 24);
        assert_eq!(settings.owner_rate_bps, 1_000);
        assert!(settings.provider_config().is_none());
    }
}
