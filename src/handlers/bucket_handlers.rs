//! Bucket-level endpoints.

use crate::{
    errors::AppError, handlers::object_handlers::ensure_location_safe, models::object::BucketStats,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderName, Method, header},
};

/// `GET /{bucket}`: object count and total bytes, answered from the index.
pub async fn bucket_stats(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketStats>, AppError> {
    // Any placeholder key works; only the bucket segment is checked here.
    ensure_location_safe(&bucket, "_")?;
    let stats = state.index.bucket_stats(&bucket).await?;
    Ok(Json(stats))
}

/// Non-GET methods on `/{bucket}` name no object.
pub async fn bucket_fallback(method: Method) -> AppError {
    match method {
        Method::POST | Method::PUT | Method::DELETE => {
            AppError::bad_request("an object key is required")
        }
        other => AppError::method_not_allowed(format!("method {} is not supported", other)),
    }
}

/// `/{bucket}/` with an empty key.
pub async fn missing_key(method: Method) -> AppError {
    match method {
        Method::GET | Method::HEAD | Method::POST | Method::PUT | Method::DELETE => {
            AppError::bad_request("an object key is required")
        }
        other => AppError::method_not_allowed(format!("method {} is not supported", other)),
    }
}

/// `GET /robots.txt`
pub async fn robots() -> ([(HeaderName, &'static str); 1], &'static str) {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nDisallow: /",
    )
}
