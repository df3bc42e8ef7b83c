use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::ArtifactService;
use crate::domain::{Attachments, Lookup, normalize_relative_path};
use crate::error::MigrateError;
use crate::storage::FileIndex;
use crate::transfer::{RetryingTransfer, Transport};

/// Per-file result of one upload pass, in planned order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub uploaded: Vec<String>,
    pub already_present: Vec<String>,
    pub unavailable: Vec<String>,
    pub failed: Vec<String>,
    /// The pass stopped early on cancellation; later paths were not visited.
    #[serde(skip)]
    pub cancelled: bool,
}

impl UploadSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unavailable.is_empty()
    }
}

/// `[documentation?, *covers, *sample/file]` with relative markers stripped.
pub fn planned_paths(
    documentation: Option<&str>,
    covers: &[String],
    attachments: &Attachments,
) -> Vec<String> {
    documentation
        .filter(|doc| !doc.trim().is_empty())
        .map(str::to_string)
        .into_iter()
        .chain(covers.iter().cloned())
        .chain(attachments.sample_paths())
        .map(|path| normalize_relative_path(&path).to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

pub fn content_url(base_url: &str, path: &str) -> String {
    format!("{}/{path}/content", base_url.trim_end_matches('/'))
}

pub struct FileSetUploader<'a, A, I, T>
where
    A: ArtifactService,
    I: FileIndex,
    T: Transport,
{
    pub artifacts: &'a A,
    pub index: &'a I,
    pub transfer: &'a RetryingTransfer<T>,
    pub cancel: &'a CancellationToken,
    pub download_weight: f64,
}

impl<A, I, T> FileSetUploader<'_, A, I, T>
where
    A: ArtifactService,
    I: FileIndex,
    T: Transport,
{
    /// Copies every planned file that exists upstream and is missing from the
    /// artifact. Individual file failures are recorded, never returned. On
    /// cancellation the files handled so far are returned with `cancelled` set.
    pub async fn upload(
        &self,
        artifact_id: &str,
        base_url: &str,
        paths: &[String],
    ) -> Result<UploadSummary, MigrateError> {
        let available = self.index.list(base_url).await?;
        let mut summary = UploadSummary::default();

        for path in paths {
            if self.cancel.is_cancelled() {
                warn!(artifact_id, "cancelled before {path}");
                summary.cancelled = true;
                return Ok(summary);
            }

            if !available.contains(path) {
                warn!(artifact_id, file = %path, "file not found in {base_url}");
                summary.unavailable.push(path.clone());
                continue;
            }

            match self.artifacts.get_file(artifact_id, path).await {
                Ok(Lookup::Found(_)) => {
                    info!(artifact_id, file = %path, "already stored");
                    summary.already_present.push(path.clone());
                    continue;
                }
                Ok(Lookup::NotFound) => {}
                Err(err) => {
                    error!(artifact_id, file = %path, status = err.status(), "existence check failed: {err}");
                    summary.failed.push(path.clone());
                    continue;
                }
            }

            let put_url = match self
                .artifacts
                .put_file(artifact_id, path, self.download_weight)
                .await
            {
                Ok(url) => url,
                Err(err) => {
                    error!(artifact_id, file = %path, status = err.status(), "no upload target: {err}");
                    summary.failed.push(path.clone());
                    continue;
                }
            };

            let source = content_url(base_url, path);
            info!(artifact_id, file = %path, "uploading from {source}");
            match self.transfer.upload(&source, &put_url).await {
                Ok(report) => {
                    info!(artifact_id, file = %path, attempts = report.attempts, bytes = report.bytes, "uploaded");
                    summary.uploaded.push(path.clone());
                }
                Err(MigrateError::Cancelled) => {
                    warn!(artifact_id, file = %path, "cancelled during upload");
                    summary.cancelled = true;
                    return Ok(summary);
                }
                Err(err) => {
                    error!(artifact_id, file = %path, status = err.status(), "{err}");
                    summary.failed.push(path.clone());
                }
            }
        }

        info!(
            artifact_id,
            uploaded = summary.uploaded.len(),
            already_present = summary.already_present.len(),
            unavailable = summary.unavailable.len(),
            failed = summary.failed.len(),
            "file sync finished"
        );
        Ok(summary)
    }
}
