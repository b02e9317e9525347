use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_util::AppStateData;

/// Liveness check. Stays "ok" while the quota store is degraded.
pub async fn health_handler(State(app_state): State<AppStateData>) -> Json<Value> {
    let tracker = &app_state.quota_tracker;
    Json(json!({
        "status": "ok",
        "quota_tracking": tracker.is_metered(),
        "quota_store": tracker.store().backend_name(),
        "degraded": tracker.is_degraded(),
        "subscribers": app_state.subscriber_keys.len(),
    }))
}

pub async fn status_handler(State(app_state): State<AppStateData>) -> Json<Value> {
    let tracker = &app_state.quota_tracker;
    Json(json!({
        "subscriber_count": tracker.subscriber_count(),
        "daily_budget": tracker.daily_budget(),
        "daily_allotment": tracker.allotment(),
        "quota_tracking": tracker.is_metered(),
        "degraded": tracker.is_degraded(),
    }))
}
