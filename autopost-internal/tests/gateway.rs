use autopost_internal::auth::SubscriberKeys;
use autopost_internal::config_parser::Config;
use autopost_internal::gateway_util::{build_router, AppStateData};
use autopost_internal::quota::store::{InMemoryCounterStore, RestKvCounterStore};
use autopost_internal::quota::QuotaStore;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, Response, StatusCode};
use axum::routing::post;
use axum::Router;
use secrecy::SecretString;
use serde_json::Value;
use tower::ServiceExt;

fn app_state(config: &str, keys: &str, store: QuotaStore) -> AppStateData {
    AppStateData::new_with_store(
        &Config::parse(config).unwrap(),
        SubscriberKeys::from_env_value(keys),
        store,
    )
}

fn metered(config: &str, keys: &str) -> Router {
    let state = app_state(config, keys, QuotaStore::InMemory(InMemoryCounterStore::new()));
    build_router(state, upstream())
}

/// Stand-in for an embedder's proxy route
fn upstream() -> Router<AppStateData> {
    Router::new().route("/api/generate", post(|| async { "generated" }))
}

fn request(method: Method, uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("X-Auth-Key", key);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_and_status_are_public() {
    let app = metered("[quota]\nin_memory = true\n", "A,B,C,D,E");

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/api/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["quota_tracking"], true);
    assert_eq!(body["quota_store"], "memory");
    assert_eq!(body["degraded"], false);
    assert_eq!(body["subscribers"], 5);

    let response = app
        .oneshot(request(Method::GET, "/api/status", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["subscriber_count"], 5);
    assert_eq!(body["daily_budget"], 75_000);
    assert_eq!(body["daily_allotment"], 15_000);
}

#[tokio::test]
async fn protected_routes_distinguish_missing_and_invalid_keys() {
    let app = metered("", "KEY-1");

    for uri in ["/api/usage", "/api/quota/consume", "/api/generate"] {
        let method = if uri == "/api/usage" {
            Method::GET
        } else {
            Method::POST
        };

        let response = app
            .clone()
            .oneshot(request(method.clone(), uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "missing_subscriber_key");

        let response = app
            .clone()
            .oneshot(request(method, uri, Some("KEY-2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "invalid_subscriber_key");
        assert_eq!(body["error"]["code"], 401);
    }
}

#[tokio::test]
async fn upstream_and_consume_share_the_daily_allotment() {
    let app = metered("[quota]\ndaily_budget = 3\n", "KEY-1");

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/generate", Some("KEY-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-quota-remaining"], "2");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"generated");

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/quota/consume", Some("KEY-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["allotment"], 3);
    assert_eq!(body["used"], 2);
    assert_eq!(body["remaining"], 1);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["metered"], true);
    assert_eq!(body["total"], 2);

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/generate", Some("KEY-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/generate", Some("KEY-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "quota_exceeded");

    // Reading usage is free and still works once the quota is exhausted
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/usage", Some("KEY-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["used"], 3);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["allowed"], false);
        // The rejected request is not part of the lifetime total
        assert_eq!(body["total"], 3);
    }
}

#[tokio::test]
async fn unmetered_without_store() {
    let state = app_state("[quota]\ndaily_budget = 1\n", "KEY-1", QuotaStore::Disabled);
    let app = build_router(state, upstream());

    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/api/generate", Some("KEY-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-quota-limit"));
    }

    let response = app
        .oneshot(request(Method::GET, "/api/usage", Some("KEY-1")))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["metered"], false);
    assert_eq!(body["used"], Value::Null);
    assert_eq!(body["remaining"], Value::Null);
    assert!(body.get("total").is_none());
}

#[tokio::test]
async fn store_outage_is_reported_by_health_and_status() {
    // Nothing listens on port 1
    let store = QuotaStore::RestKv(
        RestKvCounterStore::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            SecretString::from("token".to_string()),
        )
        .unwrap(),
    );
    let app = build_router(app_state("", "KEY-1", store), upstream());

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/api/health", None))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["degraded"], false);

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/generate", Some("KEY-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-quota-degraded"], "true");
    assert!(!response.headers().contains_key("x-quota-limit"));

    for uri in ["/api/health", "/api/status"] {
        let response = app
            .clone()
            .oneshot(request(Method::GET, uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        let body = json_body(response).await;
        assert_eq!(body["degraded"], true, "{uri}");
        assert_eq!(body["quota_tracking"], true, "{uri}");
    }
}

#[tokio::test]
async fn unknown_routes_return_json_404() {
    let app = metered("", "KEY-1");
    let response = app
        .oneshot(request(Method::GET, "/api/nope", Some("KEY-1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "not_found");
}
