use once_cell::sync::Lazy;
use std::fs;

use crate::advertising::models::PackageType;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// Postgres connection string. When unset the engine runs on the in-memory store.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: payment-gateway-config -> base URL of the card/wallet charge service
pub static PAYMENT_GATEWAY_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PAYMENT_GATEWAY_URL"));

/// key: payment-gateway-config -> bearer key, inline or from `PAYMENT_GATEWAY_API_KEY_FILE`
pub static PAYMENT_GATEWAY_API_KEY: Lazy<Option<String>> =
    Lazy::new(|| read_secret_env("PAYMENT_GATEWAY_API_KEY", "PAYMENT_GATEWAY_API_KEY_FILE"));

/// Monthly prices in KRW, VAT included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackagePrices {
    pub basic: i64,
    pub standard: i64,
    pub premium: i64,
}

impl PackagePrices {
    pub fn price_for(&self, package: PackageType) -> i64 {
        match package {
            PackageType::Basic => self.basic,
            PackageType::Standard => self.standard,
            PackageType::Premium => self.premium,
        }
    }
}

impl Default for PackagePrices {
    fn default() -> Self {
        Self {
            basic: 30_000,
            standard: 50_000,
            premium: 100_000,
        }
    }
}

/// key: advertising-config -> everything the engine needs, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingConfig {
    /// Shared secret the cron trigger presents. `None` makes the cron endpoint refuse to run.
    pub cron_secret: Option<String>,
    pub package_prices: PackagePrices,
    pub bank_transfer_window_hours: i64,
    pub credit_validity_days: i64,
    pub job_lease_secs: i64,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            cron_secret: None,
            package_prices: PackagePrices::default(),
            bank_transfer_window_hours: 72,
            credit_validity_days: 365,
            job_lease_secs: 900,
        }
    }
}

impl AdvertisingConfig {
    /// Builds the config from any key lookup; unset, blank or unparsable values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let positive = |key: &str, default: i64| {
            read(key)
                .and_then(|value| value.parse::<i64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };

        let defaults = Self::default();
        Self {
            cron_secret: read("ADVERTISING_CRON_SECRET").or_else(|| read("CRON_SECRET")),
            package_prices: PackagePrices {
                basic: positive("AD_PRICE_BASIC", defaults.package_prices.basic),
                standard: positive("AD_PRICE_STANDARD", defaults.package_prices.standard),
                premium: positive("AD_PRICE_PREMIUM", defaults.package_prices.premium),
            },
            bank_transfer_window_hours: positive(
                "AD_BANK_TRANSFER_WINDOW_HOURS",
                defaults.bank_transfer_window_hours,
            ),
            credit_validity_days: positive(
                "AD_CREDIT_VALIDITY_DAYS",
                defaults.credit_validity_days,
            ),
            job_lease_secs: positive("AD_JOB_LEASE_SECS", defaults.job_lease_secs),
        }
    }
}

pub fn advertising_config_from_env() -> AdvertisingConfig {
    AdvertisingConfig::from_lookup(|key| std::env::var(key).ok())
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}
