use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;

use tokengate::{
    bucket::{BucketState, CheckOutcome},
    config::RouteRule,
    gateway::{rate_limit_middleware, status_handler, GatewayState},
    identity::IdentityExtractor,
    limiter::{DenyReason, LimiterOptions, RateLimiter},
    metrics::Metrics,
    policy::{Policy, PolicyResolver, RuleConfig, RulesConfig},
    store::{MemoryTokenStore, TokenStore},
    GateError,
};

fn rules(defs: &[(&str, f64, u32)]) -> RulesConfig {
    RulesConfig {
        rules: defs
            .iter()
            .map(|(id, rate, capacity)| RuleConfig {
                id: id.to_string(),
                refill_rate_per_second: *rate,
                capacity: *capacity,
            })
            .collect(),
    }
}

fn build_limiter(store: Arc<dyn TokenStore>, defs: &[(&str, f64, u32)]) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        IdentityExtractor::new("integration-secret"),
        Arc::new(PolicyResolver::from_rules(rules(defs)).unwrap()),
        store,
        Arc::new(Metrics::new().unwrap()),
        LimiterOptions {
            deny_cache_enabled: false,
            ..Default::default()
        },
    ))
}

#[tokio::test]
async fn test_burst_deny_and_refill_scenario() {
    // capacity=10, rate=10/s: 10 checks at t=0 pass, the 11th is denied
    // with reset ~t+0.1, and at t=1.0 the bucket is full again.
    let limiter = build_limiter(Arc::new(MemoryTokenStore::new()), &[("default", 10.0, 10)]);

    for i in 0..10 {
        let decision = limiter.check_at("user:alice", "default", 0.0).await.unwrap();
        assert!(decision.passed, "check {} should pass", i);
    }
    let last = limiter.check_at("user:alice", "default", 0.0).await.unwrap();
    assert!(!last.passed);
    assert_eq!(last.remaining, 0);

    let refilled = limiter.check_at("user:alice", "default", 1.0).await.unwrap();
    assert!(refilled.passed);
    assert_eq!(refilled.remaining, 9);
}

#[tokio::test]
async fn test_deny_then_eventually_allow_matches_reset_time() {
    let store = MemoryTokenStore::new();
    let policy = Policy {
        rule_id: "default".to_string(),
        refill_rate_per_second: 10.0,
        capacity: 10,
    };

    let mut now = 0.0;
    for _ in 0..10 {
        assert!(store.check_and_consume("k", &policy, now).await.unwrap().allowed);
    }

    let denied = store.check_and_consume("k", &policy, now).await.unwrap();
    assert!(!denied.allowed);
    assert!((denied.reset_time - 0.1).abs() < 1e-9);

    // Just before the reported reset the check still fails...
    now = denied.reset_time - 0.01;
    assert!(!store.check_and_consume("k", &policy, now).await.unwrap().allowed);

    // ...and the next token appears no earlier than 1/rate after that
    // write-back, matching the newly reported reset. The epsilon absorbs
    // rounding in the fractional refill.
    let denied_again = store.check_and_consume("k", &policy, now).await.unwrap();
    let allowed = store
        .check_and_consume("k", &policy, denied_again.reset_time + 1e-6)
        .await
        .unwrap();
    assert!(allowed.allowed);
}

#[tokio::test]
async fn test_concurrent_checks_consume_at_most_one_token() {
    // Scenario 4: one token available, many concurrent checks, exactly one
    // passes.
    let limiter = build_limiter(Arc::new(MemoryTokenStore::new()), &[("default", 0.001, 1)]);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .check_at("api_key:deadbeef", "default", 1000.0)
                .await
                .unwrap()
                .passed
        }));
    }

    let mut passed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            passed += 1;
        }
    }
    assert_eq!(passed, 1);
}

#[tokio::test]
async fn test_allowed_count_bounded_by_capacity_plus_refill() {
    // Over any window, allowed checks never exceed
    // capacity + floor(window * rate).
    let store = MemoryTokenStore::new();
    let policy = Policy {
        rule_id: "default".to_string(),
        refill_rate_per_second: 2.0,
        capacity: 5,
    };

    let mut allowed = 0;
    for i in 0..40 {
        let now = i as f64 * 0.1; // 4 second window
        let outcome = store.check_and_consume("k", &policy, now).await.unwrap();
        if outcome.allowed {
            allowed += 1;
        }
        assert!(outcome.tokens_remaining >= 0.0);
        assert!(outcome.tokens_remaining <= 5.0);
    }

    assert!(allowed <= 5 + (4.0_f64 * 2.0) as i32, "allowed {} checks", allowed);
}

#[tokio::test]
async fn test_independent_buckets_per_identity_and_rule() {
    let limiter = build_limiter(
        Arc::new(MemoryTokenStore::new()),
        &[("default", 0.001, 1), ("search", 0.001, 1)],
    );

    assert!(limiter.check_at("ip:10.0.0.1", "default", 0.0).await.unwrap().passed);
    assert!(!limiter.check_at("ip:10.0.0.1", "default", 0.0).await.unwrap().passed);

    // Same identity, different rule: separate bucket.
    assert!(limiter.check_at("ip:10.0.0.1", "search", 0.0).await.unwrap().passed);
    // Different identity, same rule: separate bucket.
    assert!(limiter.check_at("ip:10.0.0.2", "default", 0.0).await.unwrap().passed);
}

struct UnreachableStore;

#[async_trait]
impl TokenStore for UnreachableStore {
    async fn check_and_consume(
        &self,
        _key: &str,
        _policy: &Policy,
        _now: f64,
    ) -> tokengate::Result<CheckOutcome> {
        Err(GateError::StoreUnavailable("all shards down".to_string()))
    }

    async fn peek(&self, _key: &str) -> tokengate::Result<Option<BucketState>> {
        Err(GateError::StoreUnavailable("all shards down".to_string()))
    }

    async fn reset(&self, _key: &str) -> tokengate::Result<bool> {
        Err(GateError::StoreUnavailable("all shards down".to_string()))
    }

    async fn health_check(&self) -> tokengate::Result<()> {
        Err(GateError::StoreUnavailable("all shards down".to_string()))
    }
}

#[tokio::test]
async fn test_fail_closed_under_store_outage() {
    let limiter = build_limiter(Arc::new(UnreachableStore), &[("default", 10.0, 10)]);

    // The decision must come back denied within a bounded time, not hang.
    let decision = tokio::time::timeout(
        Duration::from_secs(2),
        limiter.check("user:alice", "default"),
    )
    .await
    .expect("check must not hang")
    .unwrap();

    assert!(!decision.passed);
    assert_eq!(decision.reason, Some(DenyReason::StoreUnavailable));
}

#[tokio::test]
async fn test_identity_extraction_is_stable_across_retries() {
    let limiter = build_limiter(Arc::new(MemoryTokenStore::new()), &[("default", 10.0, 10)]);

    let mut headers = http::HeaderMap::new();
    headers.insert("x-api-key", http::HeaderValue::from_static("retry-key"));

    let first = limiter.extract_identity(&headers, None);
    let second = limiter.extract_identity(&headers, None);
    assert_eq!(first, second);
    assert!(first.starts_with("api_key:"));
}

// HTTP-facing contract through the middleware

fn test_app(defs: &[(&str, f64, u32)], routes: Vec<RouteRule>) -> Router {
    let limiter = build_limiter(Arc::new(MemoryTokenStore::new()), defs);
    let state = GatewayState::new(limiter, routes);

    Router::new()
        .route("/api/hello", get(|| async { "hello" }))
        .route("/healthcheck", get(|| async { "ok" }))
        .route("/ratelimit/status", get(status_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
}

fn request_with_key(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", key)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_allowed_response_carries_rate_limit_headers() {
    let app = test_app(&[("default", 10.0, 10)], vec![]);

    let response = app
        .oneshot(request_with_key("/api/hello", "client-1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "9");
    assert!(headers.contains_key("x-ratelimit-reset"));
}

#[tokio::test]
async fn test_exhausted_bucket_returns_429_contract() {
    let app = test_app(&[("default", 0.001, 1)], vec![]);

    let ok = app
        .clone()
        .oneshot(request_with_key("/api/hello", "client-2"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let denied = app
        .oneshot(request_with_key("/api/hello", "client-2"))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers().get("x-ratelimit-remaining").unwrap(), "0");

    let body = to_bytes(denied.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Rate limit exceeded");
    assert_eq!(json["limit"], 1);
    assert_eq!(json["remaining"], 0);
    assert!(json["resetTime"].is_i64());
    assert!(json["message"].as_str().unwrap().contains("Too many requests"));
}

#[tokio::test]
async fn test_excluded_paths_are_never_limited() {
    let app = test_app(&[("default", 0.001, 1)], vec![]);

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(request_with_key("/healthcheck", "client-3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_route_rule_selects_per_route_bucket() {
    let app = test_app(
        &[("default", 100.0, 100), ("api", 0.001, 1)],
        vec![RouteRule {
            prefix: "/api".to_string(),
            rule_id: "api".to_string(),
        }],
    );

    let first = app
        .clone()
        .oneshot(request_with_key("/api/hello", "client-4"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers().get("x-ratelimit-limit").unwrap(), "1");

    let second = app
        .oneshot(request_with_key("/api/hello", "client-4"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_unknown_route_rule_surfaces_config_error() {
    let app = test_app(
        &[("default", 100.0, 100)],
        vec![RouteRule {
            prefix: "/api".to_string(),
            rule_id: "not-configured".to_string(),
        }],
    );

    let response = app
        .oneshot(request_with_key("/api/hello", "client-5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_status_endpoint_reports_without_consuming() {
    let app = test_app(&[("default", 10.0, 10)], vec![]);

    // Consume one token, then read status twice.
    app.clone()
        .oneshot(request_with_key("/api/hello", "client-6"))
        .await
        .unwrap();

    let status = app
        .clone()
        .oneshot(request_with_key("/ratelimit/status", "client-6"))
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);

    let body = to_bytes(status.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["capacity"], 10);
    assert!(json["tokens"].as_f64().unwrap() <= 10.0);
    assert!(json["client_id"].as_str().unwrap().starts_with("api_key:"));
}
