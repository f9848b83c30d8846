//! HTTP rendering of rate limit and lockout outcomes.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lockout::LockoutStatus;
use crate::ratelimit::limiter::seconds_until;
use crate::ratelimit::RateLimitInfo;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Body of every 429 caused by a rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitBody {
    pub error: String,
    pub code: u16,
    pub retry_after: u64,
}

/// Body of error responses that carry no retry hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
/// (unix seconds).
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_at.timestamp()));
}

/// A rate limit denial.
#[derive(Debug, Clone)]
pub struct RateLimited {
    pub info: RateLimitInfo,
    pub message: String,
}

impl RateLimited {
    pub fn new(info: RateLimitInfo, message: impl Into<String>) -> Self {
        Self {
            info,
            message: message.into(),
        }
    }
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let retry_after = self.info.retry_after_secs();
        let body = RateLimitBody {
            error: self.message,
            code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            retry_after,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        apply_rate_limit_headers(headers, &self.info);
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        response
    }
}

/// A 429 with only a retry hint, for requests that could not be keyed.
#[derive(Debug, Clone)]
pub struct TooManyRequests {
    pub retry_after: u64,
    pub message: String,
}

impl IntoResponse for TooManyRequests {
    fn into_response(self) -> Response {
        let body = RateLimitBody {
            error: self.message,
            code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            retry_after: self.retry_after,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(self.retry_after));
        response
    }
}

pub const ACCOUNT_LOCKED_MESSAGE: &str =
    "Account temporarily locked due to too many failed attempts. Please try again later.";

/// A request against a locked account.
#[derive(Debug, Clone, Copy)]
pub struct AccountLocked {
    pub status: LockoutStatus,
}

impl IntoResponse for AccountLocked {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ACCOUNT_LOCKED_MESSAGE.to_string(),
            code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response.headers_mut().insert(
            RETRY_AFTER,
            HeaderValue::from(self.status.seconds_until_unlock().max(1)),
        );
        response
    }
}

/// Render a plain `{"error", "code"}` response.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: message.into(),
        code: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

/// Human readable time until `reset_at`: `"N seconds"` under a minute,
/// otherwise whole `"N minutes"`.
pub fn format_reset_time(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = seconds_until(reset_at, now);
    if secs < 60 {
        format!("{} seconds", secs)
    } else {
        format!("{} minutes", secs / 60)
    }
}
