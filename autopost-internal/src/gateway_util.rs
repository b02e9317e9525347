use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use reqwest::Client;

use crate::auth::{require_subscriber_key, SubscriberKeys};
use crate::config_parser::{
    Config, EnvSettings, KV_REST_API_TOKEN_ENV, KV_REST_API_URL_ENV, SUBSCRIBER_KEYS_ENV,
};
use crate::endpoints;
use crate::error::{Error, ErrorDetails};
use crate::quota::store::{InMemoryCounterStore, RedisCounterStore, RestKvCounterStore};
use crate::quota::{quota_middleware, QuotaStore, QuotaTracker, QuotaTrackerConfig};

/// State for the API
#[derive(Clone)]
pub struct AppStateData {
    pub subscriber_keys: SubscriberKeys,
    pub quota_tracker: Arc<QuotaTracker>,
}

impl AppStateData {
    pub async fn new(config: &Config, env: EnvSettings) -> Result<Self, Error> {
        let http_client = setup_http_client()?;
        let subscriber_keys = setup_subscriber_keys(&env);
        let store = setup_quota_store(config, &env, &http_client).await?;
        Ok(Self::new_with_store(config, subscriber_keys, store))
    }

    pub fn new_with_store(
        config: &Config,
        subscriber_keys: SubscriberKeys,
        store: QuotaStore,
    ) -> Self {
        let quota_tracker = QuotaTracker::new(
            store,
            QuotaTrackerConfig::from(&config.quota),
            subscriber_keys.len(),
        );
        tracing::info!(
            subscribers = subscriber_keys.len(),
            daily_budget = quota_tracker.daily_budget(),
            daily_allotment = quota_tracker.allotment(),
            quota_store = quota_tracker.store().backend_name(),
            "Quota tracking configured"
        );
        Self {
            subscriber_keys,
            quota_tracker: Arc::new(quota_tracker),
        }
    }
}

pub fn setup_subscriber_keys(env: &EnvSettings) -> SubscriberKeys {
    let keys = env
        .subscriber_keys
        .as_deref()
        .map(SubscriberKeys::from_env_value)
        .unwrap_or_default();
    if keys.is_empty() {
        tracing::warn!(
            "No subscriber keys configured (`{SUBSCRIBER_KEYS_ENV}` is unset or empty). Every authenticated request will be rejected."
        );
    }
    keys
}

/// Pick the quota store backend from the environment and config.
///
/// A malformed store URL is a startup error. An unreachable Redis is only
/// logged; requests then fail open (or closed) per `quota.fail_open`.
pub async fn setup_quota_store(
    config: &Config,
    env: &EnvSettings,
    http_client: &Client,
) -> Result<QuotaStore, Error> {
    if let Some(url) = &env.kv_rest_api_url {
        let token = env.kv_rest_api_token.clone().ok_or_else(|| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "`{KV_REST_API_URL_ENV}` is set but `{KV_REST_API_TOKEN_ENV}` is missing"
                ),
            })
        })?;
        let store = RestKvCounterStore::new(http_client.clone(), url, token)?;
        tracing::info!("Using the KV REST API for quota tracking");
        return Ok(QuotaStore::RestKv(store));
    }

    if let Some(url) = &env.redis_url {
        let store = RedisCounterStore::new(url)?;
        if let Err(e) = store.warm_up().await {
            tracing::warn!("Redis is not reachable yet, quota tracking is degraded until it is: {e}");
        }
        return Ok(QuotaStore::Redis(store));
    }

    if config.quota.in_memory {
        tracing::info!("Using in-process counters for quota tracking");
        let store = InMemoryCounterStore::new();
        spawn_counter_purge(store.clone());
        return Ok(QuotaStore::InMemory(store));
    }

    tracing::info!("No quota store configured: usage is not metered");
    Ok(QuotaStore::Disabled)
}

const COUNTER_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Periodically drop expired in-process counters so old days do not accumulate
fn spawn_counter_purge(store: InMemoryCounterStore) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTER_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired();
            tracing::debug!(counters = store.len(), "Purged expired quota counters");
        }
    });
}

pub const DEFAULT_HTTP_CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub fn setup_http_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(DEFAULT_HTTP_CLIENT_TIMEOUT)
        .build()
        .map_err(|e| {
            Error::new(ErrorDetails::AppState {
                message: format!("Failed to build HTTP client: {e}"),
            })
        })
}

/// Assemble the API router.
///
/// `upstream` holds the embedder's proxy routes. They sit behind key
/// validation and are charged against the daily quota, like
/// `POST /api/quota/consume`. `GET /api/usage` needs a key but is free.
pub fn build_router(app_state: AppStateData, upstream: Router<AppStateData>) -> Router {
    let charged = Router::new()
        .route("/api/quota/consume", post(endpoints::usage::consume_handler))
        .merge(upstream)
        .route_layer(from_fn_with_state(app_state.clone(), quota_middleware));

    let authenticated = Router::new()
        .route("/api/usage", get(endpoints::usage::usage_handler))
        .merge(charged)
        .route_layer(from_fn_with_state(
            app_state.clone(),
            require_subscriber_key,
        ));

    Router::new()
        .route("/api/health", get(endpoints::status::health_handler))
        .route("/api/status", get(endpoints::status::status_handler))
        .merge(authenticated)
        .fallback(endpoints::fallback::handle_404)
        .with_state(app_state)
}
