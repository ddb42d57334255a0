use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::archive::{ARCHIVE_CONTENT_TYPE, ARCHIVE_SUFFIX, archive_key};
use crate::config::Settings;
use crate::export::{ExportParams, Exporter};
use crate::job::{JobState, StatusTable, now_unix_ms};
use crate::storage::ObjectStore;
use crate::{Error, Result};

/// Everything one backup run needs from the caller.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub project_id: String,
    pub dataset: String,
    pub api_version: String,
    pub token: String,
    pub project_name: String,
}

/// Kicks off one export-then-upload job and returns its id.
///
/// The Pending entry is written before this returns, so a status query
/// issued immediately afterwards always finds the job. The job itself
/// runs as a detached task; every failure is caught there and recorded
/// into the table, never surfaced to the caller.
pub fn start_backup(
    table: &StatusTable,
    exporter: Arc<dyn Exporter>,
    store: Arc<dyn ObjectStore>,
    settings: Settings,
    request: BackupRequest,
) -> String {
    let job_id = format!(
        "{}-{}-{}",
        request.project_id,
        request.dataset,
        now_unix_ms()
    );
    table.insert_pending(&job_id);
    debug!(
        event = "job.started",
        job_id,
        project_id = %request.project_id,
        dataset = %request.dataset,
        "job.started"
    );

    let task_table = table.clone();
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        run_job(task_job_id, task_table, exporter, store, settings, request).await;
    });

    job_id
}

async fn run_job(
    job_id: String,
    table: StatusTable,
    exporter: Arc<dyn Exporter>,
    store: Arc<dyn ObjectStore>,
    settings: Settings,
    request: BackupRequest,
) {
    let archive_path = job_archive_path(&settings, &job_id);

    let outcome = drive_job(
        &job_id,
        &table,
        exporter.as_ref(),
        store.as_ref(),
        &settings,
        &request,
        &archive_path,
    )
    .await;

    match outcome {
        Ok((s3_location, etag)) => {
            table.mark_completed(&job_id, &s3_location, etag.as_deref());
        }
        Err(e) => {
            remove_archive_best_effort(&job_id, &archive_path).await;
            table.mark_failed(&job_id, &e.to_string());
        }
    }
}

async fn drive_job(
    job_id: &str,
    table: &StatusTable,
    exporter: &dyn Exporter,
    store: &dyn ObjectStore,
    settings: &Settings,
    request: &BackupRequest,
    archive_path: &Path,
) -> Result<(String, Option<String>)> {
    // Pre-flight: refuse to touch any collaborator with broken config.
    settings.validate()?;

    let params = ExportParams {
        project_id: request.project_id.clone(),
        dataset: request.dataset.clone(),
        api_version: request.api_version.clone(),
        token: request.token.clone(),
    };
    exporter.probe(&params).await?;

    table.set_state(job_id, JobState::Exporting, "exporting dataset");
    exporter.export(&params, archive_path).await?;
    verify_archive(archive_path).await?;

    table.set_state(job_id, JobState::Uploading, "uploading archive");
    let key = archive_key(&request.project_name, &request.dataset, &request.project_id);
    let metadata = HashMap::from([
        ("project-id".to_string(), request.project_id.clone()),
        ("dataset".to_string(), request.dataset.clone()),
        ("export-timestamp".to_string(), now_unix_ms().to_string()),
    ]);
    let etag = store
        .upload_file(&key, archive_path, ARCHIVE_CONTENT_TYPE, &metadata, &|pct| {
            table.set_progress(job_id, pct)
        })
        .await?;

    remove_archive_best_effort(job_id, archive_path).await;

    let s3_location = format!("s3://{}/{key}", store.bucket());
    Ok((s3_location, etag))
}

/// The export collaborator reporting success is not proof an archive
/// landed on disk; an empty or missing file gets its own message so the
/// failure is distinguishable from an export-library error.
async fn verify_archive(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) | Err(_) => Err(Error::ExportMissingOutput {
            path: path.to_path_buf(),
        }),
    }
}

/// Cleanup must never mask the error that got us here; failures are
/// logged and swallowed.
async fn remove_archive_best_effort(job_id: &str, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(
                event = "job.cleanup_failed",
                job_id,
                path = %path.display(),
                error = %e,
                "job.cleanup_failed"
            );
        }
    }
}

/// Deterministic location of a job's local archive, exposed for tests.
pub fn job_archive_path(settings: &Settings, job_id: &str) -> PathBuf {
    settings.work_dir.join(format!("{job_id}{ARCHIVE_SUFFIX}"))
}
