use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Wall-clock milliseconds, strictly increasing within the process so
/// job ids derived from it never collide even when two backups start in
/// the same millisecond.
pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Exporting,
    Uploading,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub job_id: String,
    pub state: JobState,
    pub message: String,
    pub progress: Option<u8>,
    pub s3_location: Option<String>,
    pub etag: Option<String>,
    pub error: Option<String>,
    pub started_at: u64,
}

/// Read-oriented snapshot of a job, as served by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: JobState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub start_time: u64,
    pub duration: u64,
}

/// Process-local map of job id to lifecycle state.
///
/// Entries are never removed, so the table grows for the life of the
/// process. The orchestrator task is the sole writer per job id; status
/// queries only read. Completed/Failed are terminal: later writes for
/// that id are dropped.
#[derive(Debug, Clone, Default)]
pub struct StatusTable {
    inner: Arc<RwLock<HashMap<String, BackupJob>>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fresh Pending entry. Called synchronously from
    /// `start_backup` so a status query issued right after the start
    /// request returns always sees the job.
    pub fn insert_pending(&self, job_id: &str) {
        let job = BackupJob {
            job_id: job_id.to_string(),
            state: JobState::Pending,
            message: "backup queued".to_string(),
            progress: None,
            s3_location: None,
            etag: None,
            error: None,
            started_at: now_unix_ms(),
        };
        let mut guard = self.inner.write().expect("status table lock poisoned");
        guard.insert(job_id.to_string(), job);
    }

    pub fn set_state(&self, job_id: &str, state: JobState, message: &str) {
        self.update(job_id, |job| {
            job.state = state;
            job.message = message.to_string();
        });
        debug!(event = "job.state_changed", job_id, state = ?state, "job.state_changed");
    }

    /// Progress is monotonic per job: a percentage lower than the current
    /// one is dropped (upload parts complete out of order).
    pub fn set_progress(&self, job_id: &str, percent: u8) {
        self.update(job_id, |job| {
            if job.progress.is_none_or(|current| percent >= current) {
                job.progress = Some(percent.min(100));
            }
        });
    }

    pub fn mark_completed(&self, job_id: &str, s3_location: &str, etag: Option<&str>) {
        self.update(job_id, |job| {
            job.state = JobState::Completed;
            job.message = "backup completed".to_string();
            job.progress = Some(100);
            job.s3_location = Some(s3_location.to_string());
            job.etag = etag.map(|s| s.to_string());
        });
        debug!(event = "job.completed", job_id, s3_location, "job.completed");
    }

    pub fn mark_failed(&self, job_id: &str, error: &str) {
        self.update(job_id, |job| {
            job.state = JobState::Failed;
            job.message = "backup failed".to_string();
            job.error = Some(error.to_string());
        });
        debug!(event = "job.failed", job_id, error, "job.failed");
    }

    pub fn get(&self, job_id: &str) -> Option<BackupJob> {
        let guard = self.inner.read().expect("status table lock poisoned");
        guard.get(job_id).cloned()
    }

    pub fn status_view(&self, job_id: &str) -> Option<StatusView> {
        self.get(job_id).map(|job| StatusView {
            status: job.state,
            message: job.message,
            progress: job.progress,
            error: job.error,
            s3_location: job.s3_location,
            etag: job.etag,
            start_time: job.started_at,
            duration: now_unix_ms().saturating_sub(job.started_at) / 1000,
        })
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut BackupJob)) {
        let mut guard = self.inner.write().expect("status table lock poisoned");
        let Some(job) = guard.get_mut(job_id) else {
            return;
        };
        if job.state.is_terminal() {
            return;
        }
        f(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_job_id_is_absent() {
        let table = StatusTable::new();
        assert!(table.get("nope").is_none());
        assert!(table.status_view("nope").is_none());
    }

    #[test]
    fn pending_is_visible_immediately() {
        let table = StatusTable::new();
        table.insert_pending("j1");
        let view = table.status_view("j1").unwrap();
        assert_eq!(view.status, JobState::Pending);
        assert!(view.progress.is_none());
        assert!(view.error.is_none());
    }

    #[test]
    fn progress_never_goes_backward() {
        let table = StatusTable::new();
        table.insert_pending("j1");
        table.set_state("j1", JobState::Uploading, "uploading archive");

        table.set_progress("j1", 40);
        table.set_progress("j1", 25);
        assert_eq!(table.get("j1").unwrap().progress, Some(40));

        table.set_progress("j1", 90);
        assert_eq!(table.get("j1").unwrap().progress, Some(90));
    }

    #[test]
    fn terminal_states_reject_further_writes() {
        let table = StatusTable::new();
        table.insert_pending("j1");
        table.mark_completed("j1", "s3://bucket/key", Some("\"abc\""));

        table.mark_failed("j1", "late failure");
        table.set_progress("j1", 10);

        let job = table.get("j1").unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.error.is_none());
        assert_eq!(job.progress, Some(100));
    }

    #[test]
    fn failed_records_error_detail() {
        let table = StatusTable::new();
        table.insert_pending("j1");
        table.mark_failed("j1", "export blew up");
        let view = table.status_view("j1").unwrap();
        assert_eq!(view.status, JobState::Failed);
        assert_eq!(view.error.as_deref(), Some("export blew up"));
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&JobState::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
    }
}
