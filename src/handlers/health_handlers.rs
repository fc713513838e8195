//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and disk I/O

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe. Always returns 200 OK and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs `SELECT 1` against the metadata index.
/// 2. Performs a write/read/delete under the storage directory.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match state.index.ping().await {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let disk_check = check_disk(&state).await;

    let overall_ok = sqlite_check.ok && disk_check.ok;
    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("disk", disk_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_disk(state: &AppState) -> CheckStatus {
    let storage_dir = &state.config.storage_dir;
    if let Err(e) = fs::create_dir_all(storage_dir).await {
        return CheckStatus::failed(format!("could not create storage dir: {}", e));
    }

    // Hidden name so the reconciliation scan never picks it up.
    let tmp_path = storage_dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::failed(format!("could not write tmp file: {}", e));
    }

    let result = match fs::read(&tmp_path).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("file content mismatch".to_string()),
        Err(e) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
    };

    match fs::remove_file(&tmp_path).await {
        Ok(_) => result,
        Err(e) if result.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove tmp file: {}", e)),
        },
        Err(_) => result,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
