use axum::extract::State;
use axum::Extension;
use axum::Json;

use crate::auth::SubscriberKey;
use crate::gateway_util::AppStateData;
use crate::quota::{QuotaDecision, QuotaReport, QuotaTracker};

/// Today's usage for the calling subscriber. Does not consume quota.
pub async fn usage_handler(
    State(app_state): State<AppStateData>,
    Extension(key): Extension<SubscriberKey>,
) -> Json<QuotaReport> {
    let tracker = &app_state.quota_tracker;
    let day = QuotaTracker::today();
    let decision = tracker.usage_on(&key, day).await;
    let total = tracker.total_usage(&key).await;
    Json(QuotaReport::new(day, tracker.allotment(), &decision).with_total(total))
}

/// Charge one request and report the result.
///
/// The charge itself is made by `quota_middleware`; this handler only
/// reports the decision it left in the request extensions.
pub async fn consume_handler(
    State(app_state): State<AppStateData>,
    Extension(key): Extension<SubscriberKey>,
    decision: Option<Extension<QuotaDecision>>,
) -> Json<QuotaReport> {
    let tracker = &app_state.quota_tracker;
    let decision = decision.map_or(QuotaDecision::Unmetered, |Extension(d)| d);
    let day = decision
        .usage()
        .map_or_else(QuotaTracker::today, |usage| usage.day);
    let total = tracker.total_usage(&key).await;
    Json(QuotaReport::new(day, tracker.allotment(), &decision).with_total(total))
}
