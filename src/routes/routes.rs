//! Defines routes for the object store.
//!
//! ## Structure
//! - **Service endpoints**
//!   - `GET /healthz`, `GET /readyz`: liveness and readiness
//!   - `GET /robots.txt`: disallow all crawlers
//!
//! - **Bucket-level endpoints**
//!   - `GET /{bucket}`: object count and total size
//!   - `/{bucket}/`: rejected, an object key is required
//!
//! - **Object-level endpoints**
//!   - `GET|HEAD /{bucket}/{*key}`: download object / metadata only
//!   - `PUT|POST|DELETE /{bucket}/{*key}?x-id=<Action>`: signed writes,
//!     deletes and multipart actions
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{bucket_fallback, bucket_stats, missing_key, robots},
        health_handlers::{healthz, readyz},
        object_handlers::handle_object,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::Method,
    middleware::{self, Next},
    response::Response,
    routing::{any, get},
};
use std::time::Instant;
use tracing::info;

/// Build the router for all routes, without state attached.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/robots.txt", get(robots))
        // Object-level routes; method checks happen inside the handler
        .route("/{bucket}/{*key}", any(handle_object))
        .route("/{bucket}/", any(missing_key))
        // Bucket-level routes
        .route("/{bucket}", get(bucket_stats).fallback(bucket_fallback))
}

/// Router with body limit, access log and shared state applied.
pub fn app(state: AppState) -> Router {
    let body_limit = state.config.max_upload_size;
    routes()
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// Log reads as `METHOD STATUS URI (N.Nms)`.
async fn access_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();

    let response = next.run(req).await;

    if method == Method::GET || method == Method::HEAD {
        info!(
            "{} {} {} ({:.1}ms)",
            method,
            response.status().as_u16(),
            uri,
            started.elapsed().as_secs_f64() * 1000.0
        );
    }
    response
}
