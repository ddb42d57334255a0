use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error};

use packrat_core::orchestrator::{BackupRequest, start_backup};
use packrat_core::{
    ARCHIVE_CONTENT_TYPE, Error, Exporter, ObjectStore, Settings, StatusTable, now_unix_ms,
    summarize_archives,
};

#[derive(Clone)]
pub struct AppState {
    pub table: StatusTable,
    pub exporter: Arc<dyn Exporter>,
    pub store: Arc<dyn ObjectStore>,
    pub settings: Settings,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/backup/{project_id}/{dataset}/{api_version}/{token}/{project_name}",
            get(start_backup_route),
        )
        .route("/api/backup/status/{backup_id}", get(backup_status))
        .route("/api/backups/list", get(list_backups))
        .route("/api/backups/download/{key}", get(download_backup))
        .route("/api/health", get(health))
        // The status poller runs in a browser on another origin.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "ERROR", "message": message })),
    )
        .into_response()
}

/// Fire-and-forget start. The job id comes back immediately; the job
/// itself runs detached and is tracked through the status endpoint.
///
/// Credentials in the URL path are an inherited contract, not a design
/// endorsement; the token is never logged.
async fn start_backup_route(
    State(state): State<AppState>,
    Path((project_id, dataset, api_version, token, project_name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Response {
    let request = BackupRequest {
        project_id,
        dataset,
        api_version,
        token,
        project_name,
    };
    let backup_id = start_backup(
        &state.table,
        state.exporter.clone(),
        state.store.clone(),
        state.settings.clone(),
        request,
    );
    Json(json!({ "status": "OK", "backupId": backup_id })).into_response()
}

async fn backup_status(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
) -> Response {
    match state.table.status_view(&backup_id) {
        Some(view) => Json(view).into_response(),
        None => error_body(
            StatusCode::NOT_FOUND,
            &format!("unknown backup id: {backup_id}"),
        ),
    }
}

async fn list_backups(State(state): State<AppState>) -> Response {
    let objects = match state.store.list_objects("").await {
        Ok(objects) => objects,
        Err(e) => {
            error!(event = "api.list_failed", error = %e, "api.list_failed");
            return error_body(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    let backups = summarize_archives(
        objects
            .into_iter()
            .map(|o| (o.key, o.size, o.last_modified)),
    );
    let total_count = backups.len();
    Json(json!({
        "backups": backups,
        "totalCount": total_count,
        "bucket": state.store.bucket(),
        "region": state.store.region(),
    }))
    .into_response()
}

async fn download_backup(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    if key.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "key must not be empty");
    }

    let download = match state.store.download(&key).await {
        Ok(download) => download,
        Err(Error::NotFound { key }) => {
            return error_body(StatusCode::NOT_FOUND, &format!("no such archive: {key}"));
        }
        Err(e) => {
            error!(event = "api.download_failed", key, error = %e, "api.download_failed");
            return error_body(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    debug!(event = "api.download_started", key, "api.download_started");

    let filename = key.rsplit('/').next().unwrap_or(&key).to_string();
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        );
    if let Some(len) = download.content_length {
        response = response.header(header::CONTENT_LENGTH, len);
    }

    match response.body(Body::from_stream(download.stream)) {
        Ok(response) => response,
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn health() -> Response {
    Json(json!({ "status": "OK", "timestamp": now_unix_ms() })).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use packrat_core::{FakeExporter, MemObjectStore};
    use tempfile::TempDir;

    use super::*;

    fn test_state(temp: &TempDir) -> AppState {
        AppState {
            table: StatusTable::new(),
            exporter: Arc::new(FakeExporter::with_payload(b"tar bytes")),
            store: Arc::new(MemObjectStore::new()),
            settings: Settings {
                region: "eu-west-1".to_string(),
                bucket: "test-bucket".to_string(),
                access_key_id: "AKIATEST".to_string(),
                secret_access_key: "secret".to_string(),
                content_store_url: "https://api.invalid".to_string(),
                listen_addr: "127.0.0.1:0".to_string(),
                work_dir: temp.path().to_path_buf(),
            },
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = health().await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "OK");
        assert!(body["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn status_of_unknown_backup_is_404() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = backup_status(State(state), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ERROR");
        assert!(body["message"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn start_then_poll_reaches_completed() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = start_backup_route(
            State(state.clone()),
            Path((
                "abc123".to_string(),
                "production".to_string(),
                "2021-06-07".to_string(),
                "sk-test".to_string(),
                "acme".to_string(),
            )),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "OK");
        let backup_id = body["backupId"].as_str().unwrap().to_string();

        // Visible as pending straight away, then polled to terminal.
        assert!(state.table.get(&backup_id).is_some());
        for _ in 0..1000 {
            if let Some(job) = state.table.get(&backup_id)
                && job.state.is_terminal()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let response = backup_status(State(state), Path(backup_id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["progress"], 100);
        assert!(body["s3Location"].as_str().unwrap().starts_with("s3://"));
        assert!(body["duration"].is_u64());
    }

    #[tokio::test]
    async fn list_returns_parsed_archives_newest_first() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);
        let store = Arc::new(MemObjectStore::new());
        store.insert("acme-2025-01-15-production-abc123.tar.gz", b"old");
        store.insert("acme-2025-02-01-staging-def456.tar.gz", b"new");
        store.insert("not-an-archive.txt", b"skip me");
        let state = AppState {
            store,
            ..state
        };

        let response = list_backups(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["totalCount"], 2);
        assert_eq!(body["bucket"], "test-bucket");
        assert_eq!(body["region"], "test-region");
        assert_eq!(body["backups"][0]["date"], "2025-02-01");
        assert_eq!(body["backups"][0]["dataset"], "staging");
        assert_eq!(body["backups"][1]["date"], "2025-01-15");
    }

    #[tokio::test]
    async fn list_of_empty_bucket_is_empty_not_an_error() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = list_backups(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["totalCount"], 0);
        assert_eq!(body["backups"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn download_streams_with_attachment_headers() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);
        let store = Arc::new(MemObjectStore::new());
        store.insert("acme-2025-01-15-production-abc123.tar.gz", b"tar bytes");
        let state = AppState {
            store,
            ..state
        };

        let response = download_backup(
            State(state),
            Path("acme-2025-01-15-production-abc123.tar.gz".to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/gzip"
        );
        assert!(
            response.headers()[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .contains("acme-2025-01-15-production-abc123.tar.gz")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"tar bytes");
    }

    #[tokio::test]
    async fn download_of_missing_key_is_404() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = download_backup(State(state), Path("missing.tar.gz".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ERROR");
    }

    #[tokio::test]
    async fn download_with_blank_key_is_400() {
        let temp = TempDir::new().unwrap();
        let state = test_state(&temp);

        let response = download_backup(State(state), Path("  ".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
