//! Server Configuration

use std::path::PathBuf;

use chrono::Duration;
use credits_core::{MonitorConfig, RetryPolicy};
use credits_payments::CheckoutEnvironment;

/// Default bind address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

const DEFAULT_MAX_AGE_HOURS: i64 = 24;
const DEFAULT_LOOKUP_WINDOW_HOURS: i64 = 24;

/// Everything `main` needs, read once at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,

    /// Externally reachable base URL, used for the checkout redirect
    pub public_url: String,

    pub environment: CheckoutEnvironment,

    /// Lemon Squeezy store; payments stay disabled without it
    pub store_id: Option<String>,

    /// Auth/credit service; `None` selects the in-memory backend
    pub auth_api_url: Option<String>,

    /// JSON purchase store; `None` keeps purchases in memory
    pub purchase_store_path: Option<PathBuf>,

    /// Where the resolved user is cached between restarts
    pub user_cache_path: Option<PathBuf>,

    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
    pub max_purchase_age: Duration,
    pub lookup_window: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok());
        config.retry = RetryPolicy::from_env();
        config.monitor = MonitorConfig::from_env();
        config
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let hours = |name: &str, default: i64| {
            let raw = var(name);
            let parsed = raw.as_deref().and_then(|v| v.trim().parse::<i64>().ok()).filter(|h| *h > 0);
            if raw.is_some() && parsed.is_none() {
                tracing::warn!(name, default, "ignoring invalid hour count");
            }
            Duration::hours(parsed.unwrap_or(default))
        };

        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into());
        let public_url = var("PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{bind_addr}"))
            .trim_end_matches('/')
            .to_string();

        Self {
            public_url,
            bind_addr,
            environment: CheckoutEnvironment::from_str(&var("CHECKOUT_ENV").unwrap_or_default()),
            store_id: var("LEMONSQUEEZY_STORE_ID"),
            auth_api_url: var("AUTH_API_URL"),
            purchase_store_path: var("PURCHASE_STORE_PATH").map(PathBuf::from),
            user_cache_path: var("USER_CACHE_PATH").map(PathBuf::from),
            retry: RetryPolicy::default(),
            monitor: MonitorConfig::default(),
            max_purchase_age: hours("PURCHASE_MAX_AGE_HOURS", DEFAULT_MAX_AGE_HOURS),
            lookup_window: hours("ORDER_LOOKUP_WINDOW_HOURS", DEFAULT_LOOKUP_WINDOW_HOURS),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(config.public_url, "http://0.0.0.0:3000");
        assert!(!config.environment.is_test());
        assert!(config.store_id.is_none());
        assert!(config.purchase_store_path.is_none());
        assert_eq!(config.max_purchase_age, Duration::hours(24));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = config(&[
            ("BIND_ADDR", "127.0.0.1:4100"),
            ("PUBLIC_URL", "https://credits.example.com/"),
            ("CHECKOUT_ENV", "test"),
            ("AUTH_API_URL", "  "),
            ("PURCHASE_MAX_AGE_HOURS", "6"),
            ("ORDER_LOOKUP_WINDOW_HOURS", "-3"),
        ]);
        assert_eq!(config.public_url, "https://credits.example.com");
        assert!(config.environment.is_test());
        assert!(config.auth_api_url.is_none());
        assert_eq!(config.max_purchase_age, Duration::hours(6));
        assert_eq!(config.lookup_window, Duration::hours(24));
    }
}
