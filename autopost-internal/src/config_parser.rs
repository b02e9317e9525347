use std::net::SocketAddr;
use std::path::Path;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};

/// Total requests shared by all subscribers per UTC day
pub const DEFAULT_DAILY_BUDGET: u64 = 75_000;

pub const SUBSCRIBER_KEYS_ENV: &str = "AUTOPOST_SUBSCRIBER_KEYS";
pub const KV_REST_API_URL_ENV: &str = "KV_REST_API_URL";
pub const KV_REST_API_TOKEN_ENV: &str = "KV_REST_API_TOKEN";
pub const REDIS_URL_ENV: &str = "AUTOPOST_REDIS_URL";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_budget")]
    pub daily_budget: u64,
    /// Allow requests when the quota store cannot be reached
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Expiry applied to a day counter on its first increment
    #[serde(default = "default_counter_ttl_s")]
    pub counter_ttl_s: u64,
    /// Track usage in process memory when no external store is configured
    #[serde(default)]
    pub in_memory: bool,
}

fn default_daily_budget() -> u64 {
    DEFAULT_DAILY_BUDGET
}

fn default_fail_open() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_counter_ttl_s() -> u64 {
    48 * 60 * 60
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_budget: default_daily_budget(),
            fail_open: default_fail_open(),
            store_timeout_ms: default_store_timeout_ms(),
            counter_ttl_s: default_counter_ttl_s(),
            in_memory: false,
        }
    }
}

impl Config {
    pub async fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.to_string_lossy().to_string(),
            })
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.quota.store_timeout_ms == 0 {
            return Err(ErrorDetails::Config {
                message: "`quota.store_timeout_ms` must be greater than zero".to_string(),
            }
            .into());
        }
        if self.quota.counter_ttl_s < 24 * 60 * 60 {
            return Err(ErrorDetails::Config {
                message: "`quota.counter_ttl_s` must cover at least one full day (86400)"
                    .to_string(),
            }
            .into());
        }
        if self.quota.daily_budget == 0 {
            tracing::warn!("`quota.daily_budget` is 0: every metered request will be denied");
        }
        Ok(())
    }
}

/// Settings that come from the process environment rather than the config file
#[derive(Debug, Default)]
pub struct EnvSettings {
    pub subscriber_keys: Option<String>,
    pub kv_rest_api_url: Option<String>,
    pub kv_rest_api_token: Option<SecretString>,
    pub redis_url: Option<String>,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Empty values are treated as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            subscriber_keys: lookup(SUBSCRIBER_KEYS_ENV),
            kv_rest_api_url: non_empty(KV_REST_API_URL_ENV),
            kv_rest_api_token: non_empty(KV_REST_API_TOKEN_ENV).map(SecretString::from),
            redis_url: non_empty(REDIS_URL_ENV),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.quota.daily_budget, 75_000);
        assert!(config.quota.fail_open);
        assert_eq!(config.quota.store_timeout_ms, 500);
        assert_eq!(config.quota.counter_ttl_s, 172_800);
        assert!(!config.quota.in_memory);
        assert!(config.gateway.bind_address.is_none());
        assert!(!config.gateway.debug);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [gateway]
            bind_address = "127.0.0.1:8080"
            debug = true

            [quota]
            daily_budget = 1000
            fail_open = false
            store_timeout_ms = 250
            counter_ttl_s = 90000
            in_memory = true
            "#,
        )
        .unwrap();
        assert_eq!(
            config.gateway.bind_address,
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(config.quota.daily_budget, 1000);
        assert!(!config.quota.fail_open);
        assert_eq!(config.quota.store_timeout_ms, 250);
        assert!(config.quota.in_memory);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = Config::parse("[quota]\ndaily_limit = 5\n").unwrap_err();
        assert!(err.to_string().contains("daily_limit"), "{err}");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::parse("[quota]\nstore_timeout_ms = 0\n").is_err());
        assert!(Config::parse("[quota]\ncounter_ttl_s = 60\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[quota]\ndaily_budget = 30").unwrap();
        let config = Config::load_from_path(file.path()).await.unwrap();
        assert_eq!(config.quota.daily_budget, 30);

        let err = Config::load_from_path(Path::new("/nonexistent/autopost.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::FileRead { .. }));
    }

    #[test]
    fn test_env_settings_from_lookup() {
        let vars = HashMap::from([
            (SUBSCRIBER_KEYS_ENV, "KEY-1,KEY-2"),
            (KV_REST_API_URL_ENV, "https://kv.example.com"),
            (KV_REST_API_TOKEN_ENV, "token"),
            (REDIS_URL_ENV, "  "),
        ]);
        let env = EnvSettings::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(env.subscriber_keys.as_deref(), Some("KEY-1,KEY-2"));
        assert_eq!(env.kv_rest_api_url.as_deref(), Some("https://kv.example.com"));
        assert_eq!(
            env.kv_rest_api_token.as_ref().map(|t| t.expose_secret()),
            Some("token")
        );
        assert!(env.redis_url.is_none());
    }
}
