//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness, no I/O
//! - GET /readyz   -> metadata stores answer and the data directory is writable

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

const SCRATCH_BYTES: &[u8] = b"readyz";

/// `GET /healthz`
pub async fn healthz(State(service): State<StorageService>) -> impl IntoResponse {
    let local = service.topology.local_node();
    Json(HealthResponse {
        status: "ok",
        node_id: local.id,
        node_name: local.name,
    })
}

/// `GET /readyz`
///
/// 200 when every check passes, 503 otherwise. The body lists each check.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert(
        "metadata",
        match service.containers.ping_all().await {
            Ok(count) => CheckStatus::pass(format!("{count} containers")),
            Err(err) => CheckStatus::fail(err.to_string()),
        },
    );
    checks.insert("disk", check_disk(service.containers.data_dir()).await);

    let ready = checks.values().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        checks,
    };
    (status, Json(body))
}

/// Write, read back and remove a scratch file under `dir`.
async fn check_disk(dir: &Path) -> CheckStatus {
    let scratch = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(err) = fs::write(&scratch, SCRATCH_BYTES).await {
        return CheckStatus::fail(format!("could not write scratch file: {err}"));
    }
    let read = fs::read(&scratch).await;
    let removed = fs::remove_file(&scratch).await;
    match (read, removed) {
        (Ok(bytes), _) if bytes != SCRATCH_BYTES => CheckStatus::fail("scratch content mismatch"),
        (Err(err), _) => CheckStatus::fail(format!("could not read scratch file: {err}")),
        (Ok(_), Err(err)) => CheckStatus::pass(format!("scratch file left behind: {err}")),
        (Ok(_), Ok(())) => CheckStatus {
            ok: true,
            detail: None,
        },
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: u32,
    node_name: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    detail: Option<String>,
}

impl CheckStatus {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}
