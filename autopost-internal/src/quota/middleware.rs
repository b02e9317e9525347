use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::auth::SubscriberKey;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::AppStateData;
use crate::quota::QuotaDecision;

/// Charges one request to the authenticated subscriber's daily quota.
///
/// Must run inside [`crate::auth::require_subscriber_key`], which supplies the
/// [`SubscriberKey`] extension. The decision is forwarded to handlers as a
/// request extension and echoed in `x-quota-*` response headers.
pub async fn quota_middleware(
    State(app_state): State<AppStateData>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(key) = request.extensions().get::<SubscriberKey>().cloned() else {
        return Error::new(ErrorDetails::MissingSubscriberKey).into_response();
    };

    let decision = app_state.quota_tracker.check_and_consume(&key).await;
    let headers = decision.to_header_map();
    match &decision {
        QuotaDecision::Denied(usage) => {
            let mut response = Error::new(ErrorDetails::QuotaExceeded {
                allotment: usage.allotment,
                used: usage.used,
            })
            .into_response();
            response.headers_mut().extend(headers);
            return response;
        }
        QuotaDecision::Unavailable { reason } => {
            let mut response = Error::new(ErrorDetails::QuotaStoreUnavailable {
                reason: reason.clone(),
            })
            .into_response();
            response.headers_mut().extend(headers);
            return response;
        }
        _ => {
            debug!(subscriber = key.short_id(), ?decision, "Quota check passed");
        }
    }

    request.extensions_mut().insert(decision);
    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    response
}
