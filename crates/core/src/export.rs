use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Error, Result};

/// Parameters identifying one export of a content-store dataset.
#[derive(Debug, Clone)]
pub struct ExportParams {
    pub project_id: String,
    pub dataset: String,
    pub api_version: String,
    pub token: String,
}

/// The content-store export collaborator. Opaque to the orchestrator:
/// `export` resolves once the archive is fully written to `dest`.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Lightweight connectivity check, run before the real export.
    async fn probe(&self, params: &ExportParams) -> Result<()>;

    /// Serializes the project's documents and assets into `dest`.
    async fn export(&self, params: &ExportParams, dest: &Path) -> Result<()>;
}

pub struct HttpExporter {
    base_url: String,
    client: reqwest::Client,
}

impl HttpExporter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn project_url(&self, params: &ExportParams) -> String {
        format!(
            "{}/v{}/projects/{}",
            self.base_url, params.api_version, params.project_id
        )
    }

    fn export_url(&self, params: &ExportParams) -> String {
        format!(
            "{}/v{}/projects/{}/datasets/{}/export",
            self.base_url, params.api_version, params.project_id, params.dataset
        )
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    async fn probe(&self, params: &ExportParams) -> Result<()> {
        let url = self.project_url(params);
        let res = self
            .client
            .get(&url)
            .bearer_auth(&params.token)
            .send()
            .await
            .map_err(|e| Error::Connectivity {
                message: format!("probe request failed: {e}"),
            })?;

        if !res.status().is_success() {
            return Err(Error::Connectivity {
                message: format!("probe http {}", res.status()),
            });
        }
        debug!(event = "export.probe_ok", project_id = %params.project_id, "export.probe_ok");
        Ok(())
    }

    async fn export(&self, params: &ExportParams, dest: &Path) -> Result<()> {
        let url = self.export_url(params);
        let res = self
            .client
            .get(&url)
            .bearer_auth(&params.token)
            .send()
            .await
            .map_err(|e| Error::Export {
                message: format!("export request failed: {e}"),
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(Error::Export {
                message: format!("export http {status}: {body}"),
            });
        }

        // Stream the archive to disk chunk by chunk; exports can be far
        // larger than we want to hold in memory.
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = res.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Export {
                message: format!("export stream failed: {e}"),
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(
            event = "export.finished",
            project_id = %params.project_id,
            dataset = %params.dataset,
            bytes = written,
            dest = %dest.display(),
            "export.finished"
        );
        Ok(())
    }
}

/// Test double. Writes a canned payload (or fails) and counts invocations
/// so pre-flight tests can assert the exporter was never reached.
#[derive(Debug, Default)]
pub struct FakeExporter {
    pub probes: AtomicUsize,
    pub exports: AtomicUsize,
    pub payload: Vec<u8>,
    pub fail_probe: bool,
    pub fail_export: bool,
    /// Report success without writing the output file, to exercise the
    /// missing-archive check downstream.
    pub skip_write: bool,
}

impl FakeExporter {
    pub fn with_payload(payload: &[u8]) -> Self {
        Self {
            payload: payload.to_vec(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Exporter for FakeExporter {
    async fn probe(&self, _params: &ExportParams) -> Result<()> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if self.fail_probe {
            return Err(Error::Connectivity {
                message: "probe rejected".to_string(),
            });
        }
        Ok(())
    }

    async fn export(&self, _params: &ExportParams, dest: &Path) -> Result<()> {
        self.exports.fetch_add(1, Ordering::Relaxed);
        if self.fail_export {
            return Err(Error::Export {
                message: "export rejected".to_string(),
            });
        }
        if self.skip_write {
            return Ok(());
        }
        tokio::fs::write(dest, &self.payload).await?;
        Ok(())
    }
}
