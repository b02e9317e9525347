use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::auth::SubscriberKey;
use crate::config_parser::QuotaConfig;
use crate::error::{Error, ErrorDetails};
use crate::quota::store::QuotaStore;
use crate::quota::{daily_allotment, total_usage_key, usage_key, QuotaDecision, QuotaUsage};

/// Configuration for the quota tracker
#[derive(Clone, Debug)]
pub struct QuotaTrackerConfig {
    pub daily_budget: u64,
    /// Whether to fail open (allow) or closed (deny) on store errors
    pub fail_open: bool,
    pub store_timeout: Duration,
    pub counter_ttl: Duration,
}

impl Default for QuotaTrackerConfig {
    fn default() -> Self {
        Self::from(&QuotaConfig::default())
    }
}

impl From<&QuotaConfig> for QuotaTrackerConfig {
    fn from(config: &QuotaConfig) -> Self {
        Self {
            daily_budget: config.daily_budget,
            fail_open: config.fail_open,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            counter_ttl: Duration::from_secs(config.counter_ttl_s),
        }
    }
}

/// Splits the daily budget across subscribers and charges requests against it
#[derive(Clone)]
pub struct QuotaTracker {
    store: QuotaStore,
    config: QuotaTrackerConfig,
    subscriber_count: usize,
    /// Raised when a store operation fails, cleared by the next success
    degraded: Arc<AtomicBool>,
}

impl QuotaTracker {
    pub fn new(store: QuotaStore, config: QuotaTrackerConfig, subscriber_count: usize) -> Self {
        Self {
            store,
            config,
            subscriber_count,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn allotment(&self) -> u64 {
        daily_allotment(self.config.daily_budget, self.subscriber_count)
    }

    pub fn daily_budget(&self) -> u64 {
        self.config.daily_budget
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    pub fn store(&self) -> &QuotaStore {
        &self.store
    }

    pub fn is_metered(&self) -> bool {
        self.store.is_enabled()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// The current UTC calendar day
    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Charge one request to `key` for the current UTC day
    pub async fn check_and_consume(&self, key: &SubscriberKey) -> QuotaDecision {
        self.check_and_consume_on(key, Self::today()).await
    }

    /// Charge one request to `key` for `day`.
    ///
    /// The counter is incremented before the comparison, so denied requests
    /// are counted as well. The pre-increment value decides the outcome.
    pub async fn check_and_consume_on(
        &self,
        key: &SubscriberKey,
        day: NaiveDate,
    ) -> QuotaDecision {
        if !self.store.is_enabled() {
            record_decision("unmetered");
            return QuotaDecision::Unmetered;
        }

        let allotment = self.allotment();
        let counter_key = usage_key(key, day);
        let incr = self.store.incr(&counter_key, self.config.counter_ttl);
        match self.with_timeout(incr).await {
            Ok(count) => {
                self.mark_healthy();
                let previous = count.saturating_sub(1);
                if previous >= allotment {
                    debug!(
                        subscriber = key.short_id(),
                        allotment,
                        count,
                        "Daily quota exhausted"
                    );
                    record_decision("denied");
                    QuotaDecision::Denied(QuotaUsage::new(day, allotment, previous))
                } else {
                    record_decision("allowed");
                    self.record_total(key).await;
                    QuotaDecision::Allowed(QuotaUsage::new(day, allotment, count))
                }
            }
            Err(e) => self.store_failed(key, e),
        }
    }

    /// Inspect `key`'s usage for the current UTC day without charging it
    pub async fn usage(&self, key: &SubscriberKey) -> QuotaDecision {
        self.usage_on(key, Self::today()).await
    }

    pub async fn usage_on(&self, key: &SubscriberKey, day: NaiveDate) -> QuotaDecision {
        if !self.store.is_enabled() {
            return QuotaDecision::Unmetered;
        }

        let allotment = self.allotment();
        let counter_key = usage_key(key, day);
        match self.with_timeout(self.store.get(&counter_key)).await {
            Ok(count) => {
                self.mark_healthy();
                let usage = QuotaUsage::new(day, allotment, count);
                if count >= allotment {
                    QuotaDecision::Denied(usage)
                } else {
                    QuotaDecision::Allowed(usage)
                }
            }
            Err(e) => self.store_failed(key, e),
        }
    }

    /// Lifetime count of allowed requests for `key`.
    ///
    /// `None` when usage is unmetered or the store cannot be read.
    pub async fn total_usage(&self, key: &SubscriberKey) -> Option<u64> {
        if !self.store.is_enabled() {
            return None;
        }
        match self.with_timeout(self.store.get(&total_usage_key(key))).await {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(subscriber = key.short_id(), "Failed to read lifetime usage: {e}");
                None
            }
        }
    }

    /// Best effort: a failure here never changes the decision already made
    async fn record_total(&self, key: &SubscriberKey) {
        let total_key = total_usage_key(key);
        let incr = self.store.incr_persistent(&total_key);
        if let Err(e) = self.with_timeout(incr).await {
            warn!(subscriber = key.short_id(), "Failed to record lifetime usage: {e}");
        }
    }

    async fn with_timeout(
        &self,
        op: impl Future<Output = Result<u64, Error>>,
    ) -> Result<u64, Error> {
        match timeout(self.config.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::QuotaStoreTimeout {
                backend: self.store.backend_name(),
                timeout_ms: u64::try_from(self.config.store_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            })),
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!(
                backend = self.store.backend_name(),
                "Quota store recovered"
            );
        }
    }

    fn store_failed(&self, key: &SubscriberKey, error: Error) -> QuotaDecision {
        self.degraded.store(true, Ordering::Relaxed);
        metrics::counter!("autopost_quota_store_errors_total", "backend" => self.store.backend_name())
            .increment(1);
        let reason = error.to_string();
        if self.config.fail_open {
            warn!(
                subscriber = key.short_id(),
                "Quota store unavailable, allowing request unmetered: {reason}"
            );
            record_decision("degraded");
            QuotaDecision::Degraded { reason }
        } else {
            warn!(
                subscriber = key.short_id(),
                "Quota store unavailable, rejecting request: {reason}"
            );
            record_decision("unavailable");
            QuotaDecision::Unavailable { reason }
        }
    }
}

fn record_decision(decision: &'static str) {
    metrics::counter!("autopost_quota_decisions_total", "decision" => decision).increment(1);
}
