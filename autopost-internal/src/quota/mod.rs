pub mod middleware;
pub mod store;
pub mod tracker;

use chrono::NaiveDate;
use http::{HeaderMap, HeaderValue};
use serde::Serialize;

use crate::auth::SubscriberKey;

pub use middleware::quota_middleware;
pub use store::QuotaStore;
pub use tracker::{QuotaTracker, QuotaTrackerConfig};

const USAGE_KEY_PREFIX: &str = "usage:";
const TOTAL_KEY_PREFIX: &str = "total:";

/// Per-subscriber daily budget: `floor(daily_budget / max(1, subscriber_count))`
pub fn daily_allotment(daily_budget: u64, subscriber_count: usize) -> u64 {
    let subscribers = u64::try_from(subscriber_count.max(1)).unwrap_or(u64::MAX);
    daily_budget / subscribers
}

/// Counter-store key for a subscriber's usage on a given UTC day
pub fn usage_key(key: &SubscriberKey, day: NaiveDate) -> String {
    format!("{USAGE_KEY_PREFIX}{}:{}", key.digest(), day.format("%Y-%m-%d"))
}

/// Counter-store key for a subscriber's lifetime count of allowed requests.
/// It never expires.
pub fn total_usage_key(key: &SubscriberKey) -> String {
    format!("{TOTAL_KEY_PREFIX}{}", key.digest())
}

/// Usage of one subscriber on one UTC day
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub day: NaiveDate,
    pub allotment: u64,
    /// Requests counted so far, clamped to the allotment
    pub used: u64,
}

impl QuotaUsage {
    pub fn new(day: NaiveDate, allotment: u64, counted: u64) -> Self {
        Self {
            day,
            allotment,
            used: counted.min(allotment),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.allotment.saturating_sub(self.used)
    }
}

/// Result of charging (or inspecting) a subscriber's daily quota
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed(QuotaUsage),
    Denied(QuotaUsage),
    /// No quota store configured; usage is unlimited and not reported
    Unmetered,
    /// The store failed and the tracker is failing open
    Degraded { reason: String },
    /// The store failed and the tracker is failing closed
    Unavailable { reason: String },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(
            self,
            QuotaDecision::Allowed(_) | QuotaDecision::Unmetered | QuotaDecision::Degraded { .. }
        )
    }

    pub fn usage(&self) -> Option<&QuotaUsage> {
        match self {
            QuotaDecision::Allowed(usage) | QuotaDecision::Denied(usage) => Some(usage),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            QuotaDecision::Degraded { .. } | QuotaDecision::Unavailable { .. }
        )
    }

    /// `x-quota-*` headers describing this decision
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(usage) = self.usage() {
            headers.insert("x-quota-limit", HeaderValue::from(usage.allotment));
            headers.insert("x-quota-used", HeaderValue::from(usage.used));
            headers.insert("x-quota-remaining", HeaderValue::from(usage.remaining()));
        }
        if self.is_degraded() {
            headers.insert("x-quota-degraded", HeaderValue::from_static("true"));
        }
        headers
    }
}

/// JSON body describing a subscriber's quota, shared by `/api/usage` and `/api/quota/consume`
#[derive(Debug, Serialize)]
pub struct QuotaReport {
    pub day: NaiveDate,
    pub allotment: u64,
    pub used: Option<u64>,
    pub remaining: Option<u64>,
    pub allowed: bool,
    pub metered: bool,
    pub degraded: bool,
    /// Lifetime count of allowed requests, when the store could report it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl QuotaReport {
    pub fn new(day: NaiveDate, allotment: u64, decision: &QuotaDecision) -> Self {
        let usage = decision.usage();
        Self {
            day,
            allotment,
            used: usage.map(|u| u.used),
            remaining: usage.map(QuotaUsage::remaining),
            allowed: decision.is_allowed(),
            metered: !matches!(decision, QuotaDecision::Unmetered),
            degraded: decision.is_degraded(),
            total: None,
        }
    }

    pub fn with_total(mut self, total: Option<u64>) -> Self {
        self.total = total;
        self
    }
}
