//! Router and state for the mock HTTP service. Split out of `main.rs` so
//! integration tests can drive it with `tower::ServiceExt::oneshot` without
//! a real socket.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tem_core::{RateLimit, RateLimiter};
use tower_http::trace::TraceLayer;

#[derive(Clone, Debug, Copy)]
pub struct MockConfig {
    pub concurrency: usize,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub latency: Duration,
}

#[derive(Clone)]
struct AppState {
    in_flight: Arc<AtomicUsize>,
    concurrency: usize,
    rate_limiter: RateLimiter,
    latency: Duration,
}

pub fn build_router(config: MockConfig) -> Router {
    let state = AppState {
        in_flight: Arc::new(AtomicUsize::new(0)),
        concurrency: config.concurrency,
        rate_limiter: RateLimiter::new(RateLimit {
            capacity: config.rate_limit_requests,
            window: config.rate_limit_window,
        }),
        latency: config.latency,
    };

    Router::new()
        .route("/probe", any(probe))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn probe(State(state): State<AppState>) -> Response {
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    if current > state.concurrency {
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "503 service unavailable: concurrency ceiling exceeded",
        )
            .into_response();
    }

    if !state.rate_limiter.try_acquire().await {
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        let retry_after = state.rate_limiter.retry_after_hint().as_secs().max(1);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "429 too many requests").into_response();
        response
            .headers_mut()
            .insert("Retry-After", HeaderValue::from_str(&retry_after.to_string()).unwrap());
        return response;
    }

    tokio::time::sleep(state.latency).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    (StatusCode::OK, "200 ok").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn responds_ok_under_the_ceiling() {
        let app = build_router(MockConfig {
            concurrency: 4,
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(1),
            latency: Duration::from_millis(1),
        });

        let response = app
            .oneshot(Request::builder().uri("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn responds_429_once_the_bucket_is_empty() {
        let app = build_router(MockConfig {
            concurrency: 10,
            rate_limit_requests: 1,
            rate_limit_window: Duration::from_secs(5),
            latency: Duration::from_millis(1),
        });

        let first = app
            .clone()
            .oneshot(Request::builder().uri("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(Request::builder().uri("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn responds_503_once_concurrency_ceiling_exceeded() {
        let app = build_router(MockConfig {
            concurrency: 1,
            rate_limit_requests: 100,
            rate_limit_window: Duration::from_secs(1),
            latency: Duration::from_millis(200),
        });

        let app_a = app.clone();
        let slow = tokio::spawn(async move {
            app_a
                .oneshot(Request::builder().uri("/probe").body(Body::empty()).unwrap())
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = app
            .oneshot(Request::builder().uri("/probe").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

        let first = slow.await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }
}
