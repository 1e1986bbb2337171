//! Environment configuration.
//!
//! Only `DATABASE_URL` is required. Integrations without configuration stay
//! disabled and the endpoints depending on them answer 503.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use crate::domain::aggregates::ComboCatalog;
use crate::domain::value_objects::DelayHours;
use crate::getcid::client::DEFAULT_BASE_URL;
use crate::state_delays::{DEFAULT_CACHE_TTL_SECS, DEFAULT_DELAY_HOURS};
use crate::sync::sp_api::{DEFAULT_ENDPOINT, DEFAULT_TOKEN_URL};
use crate::sync::SpApiCredentials;

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

#[derive(Clone, Debug)]
pub struct EmailConfig {
    pub resend_api_key: String,
    pub from: String,
}

/// Credentials for one seller account the sync jobs pull from.
#[derive(Clone, Debug)]
pub struct SellerAccountConfig {
    pub name: String,
    pub credentials: SpApiCredentials,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub nats_url: Option<String>,
    pub cron_secret: Option<String>,
    pub admin_api_key: Option<String>,
    pub getcid_base_url: String,
    pub upstream_timeout: Duration,
    pub default_delay: DelayHours,
    pub state_delay_cache_ttl: chrono::Duration,
    pub combo_products: ComboCatalog,
    pub storage: Option<StorageConfig>,
    pub email: Option<EmailConfig>,
    pub app_url: String,
    pub seller_accounts: Vec<SellerAccountConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; empty values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: i64| -> Result<i64> {
            match var(key) {
                Some(raw) => raw.parse().with_context(|| format!("{key} must be a number, got {raw:?}")),
                None => Ok(default),
            }
        };

        let database_url = var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let port = u16::try_from(number("PORT", 8083)?).context("PORT out of range")?;
        let delay_hours = i32::try_from(number("DEFAULT_DELAY_HOURS", i64::from(DEFAULT_DELAY_HOURS))?)
            .context("DEFAULT_DELAY_HOURS out of range")?;
        let default_delay = DelayHours::new(delay_hours).context("DEFAULT_DELAY_HOURS")?;
        let timeout_secs = u64::try_from(number("UPSTREAM_TIMEOUT_SECS", 15)?).context("UPSTREAM_TIMEOUT_SECS out of range")?;

        let storage = match (var("STORAGE_URL"), var("STORAGE_SERVICE_KEY")) {
            (Some(url), Some(service_key)) => {
                Some(StorageConfig { url, service_key, bucket: var("STORAGE_BUCKET").unwrap_or_else(|| "uploads".into()) })
            }
            _ => None,
        };
        let email = var("RESEND_API_KEY").map(|resend_api_key| EmailConfig {
            resend_api_key,
            from: var("NOTIFY_FROM").unwrap_or_else(|| "Activation Support <support@localhost>".into()),
        });
        let token_url = var("LWA_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.into());
        let credentials = |prefix: &str| -> Option<SpApiCredentials> {
            Some(SpApiCredentials {
                client_id: var(&format!("{prefix}CLIENT_ID"))?,
                client_secret: var(&format!("{prefix}CLIENT_SECRET"))?,
                refresh_token: var(&format!("{prefix}REFRESH_TOKEN"))?,
                marketplace_id: var(&format!("{prefix}MARKETPLACE_ID"))?,
                endpoint: var(&format!("{prefix}ENDPOINT")).unwrap_or_else(|| DEFAULT_ENDPOINT.into()),
                token_url: token_url.clone(),
            })
        };
        // SP_API_ACCOUNTS=north,south reads SP_API_NORTH_CLIENT_ID and friends;
        // without it the unprefixed SP_API_* set is a single "default" account.
        let seller_accounts = match var("SP_API_ACCOUNTS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    let prefix = format!("SP_API_{}_", name.to_ascii_uppercase().replace('-', "_"));
                    credentials(&prefix)
                        .map(|credentials| SellerAccountConfig { name: name.to_string(), credentials })
                        .with_context(|| format!("seller account {name:?} needs {prefix}CLIENT_ID, CLIENT_SECRET, REFRESH_TOKEN and MARKETPLACE_ID"))
                })
                .collect::<Result<Vec<_>>>()?,
            None => credentials("SP_API_")
                .map(|credentials| SellerAccountConfig { name: "default".into(), credentials })
                .into_iter()
                .collect(),
        };

        Ok(Self {
            database_url,
            port,
            nats_url: var("NATS_URL"),
            cron_secret: var("CRON_SECRET"),
            admin_api_key: var("ADMIN_API_KEY"),
            getcid_base_url: var("GETCID_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            upstream_timeout: Duration::from_secs(timeout_secs.max(1)),
            default_delay,
            state_delay_cache_ttl: chrono::Duration::seconds(number("STATE_DELAY_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS)?.max(0)),
            combo_products: ComboCatalog::from_csv(&var("COMBO_PRODUCT_IDS").unwrap_or_default()),
            storage,
            email,
            app_url: var("APP_URL").unwrap_or_else(|| "http://localhost:3000".into()),
            seller_accounts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/fulfillment")])).unwrap();
        assert_eq!(config.port, 8083);
        assert_eq!(config.default_delay.value(), 96);
        assert_eq!(config.state_delay_cache_ttl, chrono::Duration::seconds(300));
        assert_eq!(config.getcid_base_url, "https://getcid.info");
        assert!(config.storage.is_none() && config.email.is_none() && config.seller_accounts.is_empty());
        assert!(config.cron_secret.is_none() && config.admin_api_key.is_none());
    }

    #[test]
    fn test_optional_integrations() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/fulfillment"),
            ("STORAGE_URL", "https://project.supabase.co"),
            ("STORAGE_SERVICE_KEY", "service"),
            ("COMBO_PRODUCT_IDS", "win11-pp2021, OFFICE-DUO"),
            ("CRON_SECRET", "  "),
        ]))
        .unwrap();
        assert_eq!(config.storage.unwrap().bucket, "uploads");
        assert!(config.combo_products.is_combo("WIN11-PP2021"));
        assert!(config.combo_products.is_combo("office-duo"));
        assert!(config.cron_secret.is_none());
    }

    #[test]
    fn test_single_seller_account() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "x"),
            ("SP_API_CLIENT_ID", "id"),
            ("SP_API_CLIENT_SECRET", "secret"),
            ("SP_API_REFRESH_TOKEN", "refresh"),
            ("SP_API_MARKETPLACE_ID", "A21TJRUUN4KGV"),
        ]))
        .unwrap();
        assert_eq!(config.seller_accounts.len(), 1);
        assert_eq!(config.seller_accounts[0].name, "default");
        assert_eq!(config.seller_accounts[0].credentials.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_named_seller_accounts() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "x"),
            ("SP_API_ACCOUNTS", "north, south-2"),
            ("SP_API_NORTH_CLIENT_ID", "n-id"),
            ("SP_API_NORTH_CLIENT_SECRET", "n-secret"),
            ("SP_API_NORTH_REFRESH_TOKEN", "n-refresh"),
            ("SP_API_NORTH_MARKETPLACE_ID", "A21TJRUUN4KGV"),
            ("SP_API_SOUTH_2_CLIENT_ID", "s-id"),
            ("SP_API_SOUTH_2_CLIENT_SECRET", "s-secret"),
            ("SP_API_SOUTH_2_REFRESH_TOKEN", "s-refresh"),
            ("SP_API_SOUTH_2_MARKETPLACE_ID", "A21TJRUUN4KGV"),
            ("SP_API_SOUTH_2_ENDPOINT", "https://sandbox.sellingpartnerapi-fe.amazon.com"),
        ]))
        .unwrap();
        let names: Vec<_> = config.seller_accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["north", "south-2"]);
        assert_eq!(config.seller_accounts[1].credentials.client_id, "s-id");
        assert!(config.seller_accounts[1].credentials.endpoint.contains("sandbox"));

        let missing = Config::from_lookup(lookup(&[("DATABASE_URL", "x"), ("SP_API_ACCOUNTS", "west")]));
        assert!(missing.is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[("DATABASE_URL", "x"), ("PORT", "http")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DATABASE_URL", "x"), ("DEFAULT_DELAY_HOURS", "0")])).is_err());
    }
}
