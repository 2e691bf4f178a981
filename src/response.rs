use axum::{
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::limiter::{Decision, DenyReason};

pub const HEADER_RATE_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_RATE_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RATE_RESET: &str = "x-ratelimit-reset";

/// Render an epoch reset time as an ISO-8601 UTC string for response bodies
pub fn reset_time_iso(reset_time: i64) -> Option<String> {
    Utc.timestamp_opt(reset_time, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// Attach the informational rate-limit headers to any response
pub fn apply_rate_limit_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();
    insert_header(headers, HEADER_RATE_LIMIT, decision.limit.to_string());
    insert_header(headers, HEADER_RATE_REMAINING, decision.remaining.to_string());
    insert_header(headers, HEADER_RATE_RESET, decision.reset_time.to_string());
}

fn insert_header(headers: &mut http::HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Render a denial as the externally visible 429 contract.
///
/// Exhausted buckets and fail-closed store outages share one shape; only the
/// message text distinguishes cause, so API clients keep a single decision
/// code path.
pub fn denied_response(decision: &Decision) -> Response {
    let message = match decision.reason {
        Some(DenyReason::StoreUnavailable) => {
            "Rate limiter state unavailable; request denied".to_string()
        }
        _ => match reset_time_iso(decision.reset_time) {
            Some(iso) => format!("Too many requests. Try again at {}", iso),
            None => "Too many requests".to_string(),
        },
    };

    let body = json!({
        "error": "Rate limit exceeded",
        "message": message,
        "resetTime": decision.reset_time,
        "limit": decision.limit,
        "remaining": decision.remaining,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_rate_limit_headers(&mut response, decision);
    response
}

/// Render an unknown-rule failure. A configuration bug, not a rate-limit
/// decision, so it surfaces as a server error rather than a 429.
pub fn config_error_response(rule_id: &str) -> Response {
    let body = json!({
        "error": "Configuration error",
        "message": format!("no rate limit rule configured for '{}'", rule_id),
    });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
