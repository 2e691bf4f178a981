use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tracing::warn;

use crate::{
    config::RouteRule,
    error::GateError,
    limiter::RateLimiter,
    policy::DEFAULT_RULE_ID,
    response::{apply_rate_limit_headers, config_error_response, denied_response},
};

/// Paths exempt from admission control: operational endpoints and the
/// limiter's own status/reset surface.
pub const EXCLUDED_PATHS: &[&str] = &[
    "/healthcheck",
    "/metrics",
    "/ratelimit/status",
    "/ratelimit/reset",
];

/// Shared state for the gateway layer
#[derive(Clone)]
pub struct GatewayState {
    pub limiter: Arc<RateLimiter>,
    route_rules: Arc<Vec<RouteRule>>,
}

impl GatewayState {
    pub fn new(limiter: Arc<RateLimiter>, route_rules: Vec<RouteRule>) -> Self {
        Self {
            limiter,
            route_rules: Arc::new(route_rules),
        }
    }

    /// Map a request path to its rule id; the longest configured prefix
    /// wins, anything unmatched uses the default rule.
    pub fn rule_for_path(&self, path: &str) -> &str {
        self.route_rules
            .iter()
            .filter(|rule| path.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.rule_id.as_str())
            .unwrap_or(DEFAULT_RULE_ID)
    }
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Admission-control middleware: every non-excluded request is checked
/// before it reaches the backend, and the rate-limit headers ride along on
/// both outcomes.
pub async fn rate_limit_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if EXCLUDED_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let client_id = state
        .limiter
        .extract_identity(request.headers(), peer_addr(&request));
    let rule_id = state.rule_for_path(&path).to_string();

    match state.limiter.check(&client_id, &rule_id).await {
        Ok(decision) if decision.passed => {
            let mut response = next.run(request).await;
            apply_rate_limit_headers(&mut response, &decision);
            response
        }
        Ok(decision) => denied_response(&decision),
        Err(GateError::UnknownRule(rule)) => config_error_response(&rule),
        Err(e) => {
            warn!("admission check failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Internal error",
                    "message": "admission check could not be completed",
                })),
            )
                .into_response()
        }
    }
}

/// `GET /ratelimit/status` — current bucket state for the calling client,
/// without consuming a token. `?rule=` selects a rule, default otherwise.
pub async fn status_handler(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let client_id = state
        .limiter
        .extract_identity(request.headers(), peer_addr(&request));
    let rule_id = params
        .get("rule")
        .map(String::as_str)
        .unwrap_or(DEFAULT_RULE_ID);

    match state.limiter.status(&client_id, rule_id).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "client_id": client_id,
                "tokens": status.tokens,
                "capacity": status.capacity,
                "rate": status.rate,
                "last_refill": status.last_refill,
                "resetTime": status.reset_time,
            })),
        )
            .into_response(),
        Err(GateError::UnknownRule(rule)) => config_error_response(&rule),
        Err(e) => {
            warn!("status lookup failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// `POST /ratelimit/reset` — admin operation restoring the calling client's
/// bucket to full.
pub async fn reset_handler(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    let client_id = state
        .limiter
        .extract_identity(request.headers(), peer_addr(&request));
    let rule_id = params
        .get("rule")
        .map(String::as_str)
        .unwrap_or(DEFAULT_RULE_ID);

    match state.limiter.reset(&client_id, rule_id).await {
        Ok(success) => (StatusCode::OK, Json(json!({ "success": success }))).into_response(),
        Err(e) => {
            warn!("reset failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
