use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use chrono::{FixedOffset, TimeZone, Utc};
use restaurant_intel::application::{UsageTracker, UsageTrackerConfig};
use restaurant_intel::domain::RateLimitRule;
use restaurant_intel::infrastructure::auth::UserRole;
use restaurant_intel::infrastructure::{InMemoryUsageStore, JwtAuthenticator, ManualClock, RateLimiter};
use restaurant_intel::web::{create_router, rate_limit, AppState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &[u8] = b"http-test-secret";

struct TestApp {
    router: Router,
    authenticator: Arc<JwtAuthenticator>,
    limiter: RateLimiter,
}

fn test_app() -> TestApp {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap());
    let limiter = RateLimiter::with_presets(Arc::new(clock.clone()));
    let tracker = Arc::new(UsageTracker::with_clock(
        Arc::new(InMemoryUsageStore::new()),
        Arc::new(clock),
        UsageTrackerConfig {
            billing_offset: FixedOffset::east_opt(0),
            ..Default::default()
        },
    ));
    let authenticator = Arc::new(JwtAuthenticator::new(SECRET));

    let router = create_router(AppState {
        rate_limiter: limiter.clone(),
        usage_tracker: tracker,
        authenticator: authenticator.clone(),
    });

    TestApp {
        router,
        authenticator,
        limiter,
    }
}

fn bearer(app: &TestApp, user: Uuid, roles: Vec<UserRole>) -> String {
    let token = app
        .authenticator
        .issue_token(user, roles, chrono::Duration::minutes(30))
        .unwrap();
    format!("Bearer {}", token)
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app();
    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_usage_requires_authentication() {
    let app = test_app();
    let response = app
        .router
        .oneshot(Request::get("/usage").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_track_then_list_usage() {
    let app = test_app();
    let user = Uuid::new_v4();
    let auth = bearer(&app, user, vec![UserRole::Owner]);

    for count in [3, 2] {
        let response = app
            .router
            .clone()
            .oneshot(
                Request::post("/usage")
                    .header(header::AUTHORIZATION, &auth)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(format!(
                        r#"{{"resourceType":"ai_generations","count":{}}}"#,
                        count
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
    }

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/usage?resource_type=ai_generations")
                .header(header::AUTHORIZATION, &auth)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let usage = body["usage"].as_array().unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0]["usage_count"], 5);
    assert_eq!(usage[0]["resource_type"], "ai_generations");
    assert_eq!(usage[0]["user_id"], user.to_string());

    let response = app
        .router
        .oneshot(
            Request::get("/usage/check?resource_type=ai_generations&limit=5")
                .header(header::AUTHORIZATION, &auth)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["allowed"], false);
    assert_eq!(body["current_usage"], 5);
}

#[tokio::test]
async fn test_track_usage_rejects_non_positive_count() {
    let app = test_app();
    let auth = bearer(&app, Uuid::new_v4(), vec![]);

    let response = app
        .router
        .oneshot(
            Request::post("/usage")
                .header(header::AUTHORIZATION, &auth)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"resourceType":"campaigns","count":0}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_api_rule_returns_429_with_headers() {
    let app = test_app();
    app.limiter.add_rule(
        "api",
        RateLimitRule::new(Duration::from_secs(60), 2, "Too many API requests").unwrap(),
    );

    let request = || {
        Request::get("/usage")
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
            .body(Body::empty())
            .unwrap()
    };

    // Unauthenticated calls still consume quota: throttling runs first.
    for _ in 0..2 {
        let response = app.router.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    }

    let response = app.router.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert!(response.headers().contains_key("x-ratelimit-reset"));

    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Too many API requests");
    assert_eq!(body["resetTime"], "2024-06-15T12:01:00.000Z");

    // A different client is unaffected.
    let response = app
        .router
        .oneshot(
            Request::get("/usage")
                .header("x-forwarded-for", "203.0.113.9")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_layer_skips_successful_requests_when_configured() {
    let clock = ManualClock::new(Utc::now());
    let limiter = RateLimiter::new(Arc::new(clock));
    limiter.add_rule(
        "menu-update",
        RateLimitRule::new(Duration::from_secs(60), 1, "slow down")
            .unwrap()
            .skip_successful_requests(true),
    );

    let router = Router::new()
        .route("/ok", get(|| async { "fine" }))
        .route(
            "/fail",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .layer(rate_limit(limiter.clone(), "menu-update"));

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(Request::get("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Failures still count.
    let response = router
        .clone()
        .oneshot(Request::get("/fail").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = router
        .oneshot(Request::get("/ok").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = test_app();
    let owner = bearer(&app, Uuid::new_v4(), vec![UserRole::Owner]);
    let admin = bearer(&app, Uuid::new_v4(), vec![UserRole::Admin]);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/admin/rate-limits")
                .header(header::AUTHORIZATION, &owner)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    app.limiter.check_client("192.0.2.1", "auth");
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/admin/rate-limits")
                .header(header::AUTHORIZATION, &admin)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["total_entries"], 1);

    let response = app
        .router
        .oneshot(
            Request::post("/admin/rate-limits/reset")
                .header(header::AUTHORIZATION, &admin)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"ruleKey":"auth","client":"192.0.2.1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["existed"], true);
    assert!(app.limiter.entry("192.0.2.1", "auth").is_none());
}
