use crate::domain::money::{Amount, Money};
use crate::error::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub currency: String,
    pub orders: OrderSettings,
    pub fees: FeeSchedule,
    pub payouts: PayoutSettings,
    pub locks: LockSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    pub max_revisions: u32,
    /// Used when a package does not declare its own delivery window.
    pub default_delivery_days: u32,
}

/// Platform fee taken when escrow is released:
/// `round_half_away(price * rate) + flat`, clamped to `[0, price]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub rate: Decimal,
    pub flat: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PayoutSettings {
    pub minimum_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            orders: OrderSettings::default(),
            fees: FeeSchedule::default(),
            payouts: PayoutSettings::default(),
            locks: LockSettings::default(),
            notifications: NotificationSettings::default(),
        }
    }
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            max_revisions: 3,
            default_delivery_days: 7,
        }
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            rate: Decimal::ZERO,
            flat: 0,
        }
    }
}

impl Default for PayoutSettings {
    fn default() -> Self {
        Self {
            minimum_threshold: 10_000,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            max_retries: 3,
            retry_backoff_ms: 25,
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Settings {
    /// Defaults, then the optional TOML file, then `ESCROW__SECTION__KEY`
    /// environment variables; later sources win.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("ESCROW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl PayoutSettings {
    pub fn threshold(&self) -> Money {
        Money::new(self.minimum_threshold)
    }
}

impl FeeSchedule {
    pub fn fee_for(&self, price: Amount) -> Money {
        let price = price.value();
        let proportional = (Decimal::from(price) * self.rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or(price);
        let fee = proportional.saturating_add(self.flat).clamp(0, price);
        Money::new(fee)
    }
}
