use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::{get_env_flag, get_env_with_prefix};

/// Main configuration for the reconciliation engine
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubsyncConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionSettings,
    #[serde(default)]
    pub tax: TaxSettings,
    #[serde(default)]
    pub stripe: StripeSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// Store-wide subscription switches.
///
/// Product-level overrides fall back to these when set to "use default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubscriptionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Customers may switch plans on active subscriptions
    #[serde(default = "default_true")]
    pub upgrades_downgrades: bool,
    #[serde(default = "default_true")]
    pub prorate_upgrades: bool,
    #[serde(default = "default_true")]
    pub prorate_downgrades: bool,
}

/// How catalog prices and shipping rates were entered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaxSettings {
    #[serde(default)]
    pub price_includes_tax: bool,
    #[serde(default)]
    pub shipping_includes_tax: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeSettings {
    /// Per-call timeout; remote calls are never retried inside the crate
    #[serde(default = "default_stripe_timeout")]
    pub timeout_seconds: u64,
    /// Maximum age of a signed webhook delivery
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_seconds: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_price_ttl")]
    pub price_ttl_seconds: u64,
    #[serde(default = "default_update_intent_ttl")]
    pub update_intent_ttl_seconds: u64,
}

impl CacheSettings {
    #[must_use]
    pub fn price_ttl(&self) -> Duration {
        Duration::from_secs(self.price_ttl_seconds)
    }

    #[must_use]
    pub fn update_intent_ttl(&self) -> Duration {
        Duration::from_secs(self.update_intent_ttl_seconds)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), json: false }
    }
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            upgrades_downgrades: true,
            prorate_upgrades: true,
            prorate_downgrades: true,
        }
    }
}

impl Default for StripeSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_stripe_timeout(),
            webhook_tolerance_seconds: default_webhook_tolerance(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            price_ttl_seconds: default_price_ttl(),
            update_intent_ttl_seconds: default_update_intent_ttl(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stripe_timeout() -> u64 {
    30
}

fn default_webhook_tolerance() -> i64 {
    300
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_price_ttl() -> u64 {
    2 * 60 * 60
}

fn default_update_intent_ttl() -> u64 {
    60 * 60
}

/// Builder for [`SubsyncConfig`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: SubsyncConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: SubsyncConfig::default() }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    pub fn with_subscriptions(mut self, settings: SubscriptionSettings) -> Self {
        self.config.subscriptions = settings;
        self
    }

    pub fn with_tax(mut self, tax: TaxSettings) -> Self {
        self.config.tax = tax;
        self
    }

    pub fn with_stripe_timeout(mut self, seconds: u64) -> Self {
        self.config.stripe.timeout_seconds = seconds;
        self
    }

    pub fn with_webhook_tolerance(mut self, seconds: i64) -> Self {
        self.config.stripe.webhook_tolerance_seconds = seconds;
        self
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.config.cache = cache;
        self
    }

    /// Load configuration from environment variables with SUBSYNC_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_flag("LOG_JSON") {
            self.config.logging.json = json;
        }

        let subs = &mut self.config.subscriptions;
        if let Some(v) = get_env_flag("SUBSCRIPTIONS_ENABLED") {
            subs.enabled = v;
        }
        if let Some(v) = get_env_flag("UPGRADES_DOWNGRADES") {
            subs.upgrades_downgrades = v;
        }
        if let Some(v) = get_env_flag("PRORATE_UPGRADES") {
            subs.prorate_upgrades = v;
        }
        if let Some(v) = get_env_flag("PRORATE_DOWNGRADES") {
            subs.prorate_downgrades = v;
        }

        if let Some(v) = get_env_flag("PRICE_INCLUDES_TAX") {
            self.config.tax.price_includes_tax = v;
        }
        if let Some(v) = get_env_flag("SHIPPING_INCLUDES_TAX") {
            self.config.tax.shipping_includes_tax = v;
        }

        if let Some(v) =
            get_env_with_prefix("STRIPE_TIMEOUT_SECONDS").and_then(|v| v.parse().ok())
        {
            self.config.stripe.timeout_seconds = v;
        }
        if let Some(v) =
            get_env_with_prefix("WEBHOOK_TOLERANCE_SECONDS").and_then(|v| v.parse().ok())
        {
            self.config.stripe.webhook_tolerance_seconds = v;
        }

        if let Some(v) = get_env_with_prefix("CACHE_MAX_ENTRIES").and_then(|v| v.parse().ok()) {
            self.config.cache.max_entries = v;
        }
        if let Some(v) =
            get_env_with_prefix("PRICE_CACHE_TTL_SECONDS").and_then(|v| v.parse().ok())
        {
            self.config.cache.price_ttl_seconds = v;
        }
        if let Some(v) =
            get_env_with_prefix("UPDATE_INTENT_TTL_SECONDS").and_then(|v| v.parse().ok())
        {
            self.config.cache.update_intent_ttl_seconds = v;
        }

        self
    }

    pub fn build(self) -> crate::error::Result<SubsyncConfig> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(crate::error::SubsyncError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.stripe.timeout_seconds == 0 {
            return Err(crate::error::SubsyncError::bad_request(
                "Stripe timeout must be greater than 0",
            ));
        }

        if self.config.stripe.webhook_tolerance_seconds <= 0 {
            return Err(crate::error::SubsyncError::bad_request(
                "Webhook tolerance must be greater than 0",
            ));
        }

        if self.config.cache.price_ttl_seconds == 0
            || self.config.cache.update_intent_ttl_seconds == 0
        {
            return Err(crate::error::SubsyncError::bad_request(
                "Cache TTLs must be greater than 0",
            ));
        }

        if self.config.cache.max_entries == 0 {
            return Err(crate::error::SubsyncError::bad_request(
                "Cache max_entries must be greater than 0",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
