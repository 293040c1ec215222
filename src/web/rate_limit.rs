use crate::domain::rate_limit::RateLimitDecision;
use crate::infrastructure::rate_limiter::RateLimiter;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Wraps a service with the rule registered under `rule_key`.
pub fn rate_limit(limiter: RateLimiter, rule_key: &str) -> RateLimitLayer {
    RateLimitLayer::new(limiter, rule_key)
}

#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
    rule_key: Arc<str>,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter, rule_key: &str) -> Self {
        Self {
            limiter,
            rule_key: Arc::from(rule_key),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            rule_key: self.rule_key.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimiter,
    rule_key: Arc<str>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let decision = self.limiter.check_limit(request.headers(), &self.rule_key);

        if !decision.allowed {
            let response = too_many_requests(&decision, self.limiter.now());
            return Box::pin(async move { Ok(response) });
        }

        let rule = self.limiter.rule(&self.rule_key);
        let skips = rule
            .as_ref()
            .map(|r| r.skip_successful_requests || r.skip_failed_requests)
            .unwrap_or(false);
        let request_headers = if skips {
            Some(request.headers().clone())
        } else {
            None
        };

        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        let rule_key = self.rule_key.clone();

        Box::pin(async move {
            let mut response = inner.call(request).await?;

            if let (Some(rule), Some(headers), Some(window_reset)) =
                (rule, request_headers, decision.reset_time)
            {
                let failed = response.status().is_client_error() || response.status().is_server_error();
                if (failed && rule.skip_failed_requests) || (!failed && rule.skip_successful_requests) {
                    limiter.release(&headers, &rule_key, window_reset);
                }
            }

            insert_quota_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitedBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_time: Option<String>,
}

/// 429 with `Retry-After` and the `X-RateLimit-*` headers.
pub fn too_many_requests(decision: &RateLimitDecision, now: DateTime<Utc>) -> Response {
    let body = RateLimitedBody {
        success: false,
        error: decision
            .message
            .clone()
            .unwrap_or_else(|| "Too many requests".to_string()),
        reset_time: decision.reset_time.map(iso_timestamp),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();

    if let Some(reset_time) = decision.reset_time {
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(retry_after_secs(reset_time, now)),
        );
    }
    insert_quota_headers(headers, decision);
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));

    response
}

/// Whole seconds until `reset_time`, rounded up, never negative.
pub fn retry_after_secs(reset_time: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_time - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    ((millis + 999) / 1000) as u64
}

fn insert_quota_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    if let Some(limit) = decision.limit {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    }
    if let Some(remaining) = decision.remaining {
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    }
    if let Some(reset_time) = decision.reset_time {
        if let Ok(value) = HeaderValue::from_str(&iso_timestamp(reset_time)) {
            headers.insert(RATE_LIMIT_RESET, value);
        }
    }
}

fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
