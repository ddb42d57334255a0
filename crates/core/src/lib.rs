pub mod archive;
pub mod config;
mod error;
pub mod export;
pub mod job;
mod logging;
pub mod orchestrator;
pub mod storage;

pub const APP_NAME: &str = "Packrat";

pub use archive::{ARCHIVE_CONTENT_TYPE, ArchiveSummary, archive_key, parse_archive_key, summarize_archives};
pub use config::Settings;
pub use error::{Error, Result};
pub use export::{ExportParams, Exporter, FakeExporter, HttpExporter};
pub use job::{BackupJob, JobState, StatusTable, StatusView, now_unix_ms};
pub use logging::init_logging;
pub use orchestrator::{BackupRequest, job_archive_path, start_backup};
pub use storage::{MemObjectStore, ObjectDownload, ObjectInfo, ObjectStore, S3ObjectStore};
