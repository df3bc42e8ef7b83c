use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::artifact::{ArtifactService, CreateRequest};
use crate::domain::{CatalogEntry, DatasetId, Lookup, MigrationState};
use crate::error::MigrateError;
use crate::manifest::ManifestSource;
use crate::storage::FileIndex;
use crate::transfer::{RetryingTransfer, Transport};
use crate::uploader::{FileSetUploader, UploadSummary, planned_paths};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Intentional early exit: the artifact exists and `skip_migrated` is set.
    AlreadyMigrated,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub id: DatasetId,
    pub state: MigrationState,
    /// Furthest state reached before the outcome was decided.
    pub reached: MigrationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AbortReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: UploadSummary,
}

impl MigrationOutcome {
    pub fn is_committed(&self) -> bool {
        self.state == MigrationState::Committed
    }

    /// Outcome for an entry whose migration task panicked before reporting.
    pub fn crashed(id: DatasetId) -> Self {
        Self {
            id,
            state: MigrationState::Aborted,
            reached: MigrationState::Start,
            reason: Some(AbortReason::Failed),
            error: Some("migration task panicked".to_string()),
            files: UploadSummary::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigratorSettings {
    pub workspace: String,
    pub parent_id: String,
    pub skip_migrated: bool,
    pub download_weight: f64,
}

impl MigratorSettings {
    pub fn artifact_id(&self, id: &DatasetId) -> String {
        format!("{}/{}", self.workspace, id)
    }
}

/// Runs the per-dataset state machine:
/// start -> manifest fetched -> reconciled -> staged -> files uploaded -> committed.
pub struct DatasetMigrator<M, A, I, T>
where
    M: ManifestSource,
    A: ArtifactService,
    I: FileIndex,
    T: Transport,
{
    manifests: M,
    artifacts: A,
    index: I,
    transfer: RetryingTransfer<T>,
    settings: MigratorSettings,
    cancel: CancellationToken,
}

impl<M, A, I, T> DatasetMigrator<M, A, I, T>
where
    M: ManifestSource,
    A: ArtifactService,
    I: FileIndex,
    T: Transport,
{
    pub fn new(
        manifests: M,
        artifacts: A,
        index: I,
        transfer: RetryingTransfer<T>,
        settings: MigratorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            manifests,
            artifacts,
            index,
            transfer,
            settings,
            cancel,
        }
    }

    pub fn manifests(&self) -> &M {
        &self.manifests
    }

    pub fn artifacts(&self) -> &A {
        &self.artifacts
    }

    pub fn index(&self) -> &I {
        &self.index
    }

    pub fn transfer(&self) -> &RetryingTransfer<T> {
        &self.transfer
    }

    pub fn settings(&self) -> &MigratorSettings {
        &self.settings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Migrates one catalog entry. Never fails: every error ends in an
    /// aborted outcome so sibling migrations are unaffected.
    pub async fn migrate(&self, entry: &CatalogEntry, sink: &dyn ProgressSink) -> MigrationOutcome {
        let span = info_span!("dataset", id = %entry.id);
        self.run(entry, sink).instrument(span).await
    }

    async fn run(&self, entry: &CatalogEntry, sink: &dyn ProgressSink) -> MigrationOutcome {
        let mut tracker = Tracker::new(entry.id.clone(), sink);
        if self.cancel.is_cancelled() {
            return tracker.abort(AbortReason::Cancelled, Some(&MigrateError::Cancelled));
        }

        let mut manifest = match self.manifests.fetch(&entry.rdf_source).await {
            Ok(manifest) if manifest.fields().is_empty() => {
                let err = MigrateError::ManifestParse {
                    url: entry.rdf_source.clone(),
                    message: "empty manifest".to_string(),
                };
                error!("failed to fetch manifest: {err}");
                return tracker.abort(AbortReason::Failed, Some(&err));
            }
            Ok(manifest) => manifest,
            Err(err) => {
                error!(status = err.status(), "failed to fetch manifest: {err}");
                return tracker.abort(AbortReason::Failed, Some(&err));
            }
        };
        tracker.advance(MigrationState::ManifestFetched);

        manifest.overlay(entry.overrides());
        let manifest_value = manifest.clone().into_value();
        let artifact_id = self.settings.artifact_id(&entry.id);

        match self.artifacts.read(&artifact_id).await {
            Ok(Lookup::Found(existing)) => {
                if let Err(err) = self.artifacts.edit(&existing.id, &manifest_value).await {
                    error!(status = err.status(), "failed to refresh manifest of {}: {err}", existing.id);
                    return tracker.abort(AbortReason::Failed, Some(&err));
                }
                info!("manifest refreshed on {}", existing.id);
                if self.settings.skip_migrated {
                    tracker.advance(MigrationState::Reconciled);
                    info!("dataset already migrated");
                    return tracker.abort(AbortReason::AlreadyMigrated, None);
                }
            }
            Ok(Lookup::NotFound) => {}
            Err(err) => {
                error!(status = err.status(), "failed to read artifact {artifact_id}: {err}");
                return tracker.abort(AbortReason::Failed, Some(&err));
            }
        }
        tracker.advance(MigrationState::Reconciled);

        if self.cancel.is_cancelled() {
            return tracker.abort(AbortReason::Cancelled, Some(&MigrateError::Cancelled));
        }

        let request = CreateRequest::staged_dataset(
            entry.id.as_str(),
            &self.settings.parent_id,
            manifest_value,
        );
        let staged = match self.artifacts.create(request).await {
            Ok(staged) => staged,
            Err(err) => {
                error!(status = err.status(), "failed to stage artifact: {err}");
                return tracker.abort(AbortReason::Failed, Some(&err));
            }
        };
        tracker.advance(MigrationState::Staged);

        let paths = planned_paths(
            manifest.documentation(),
            &manifest.covers(),
            &manifest.attachments(),
        );
        let uploader = FileSetUploader {
            artifacts: &self.artifacts,
            index: &self.index,
            transfer: &self.transfer,
            cancel: &self.cancel,
            download_weight: self.settings.download_weight,
        };
        let base_url = entry.content_base_url();
        match uploader.upload(&staged.id, &base_url, &paths).await {
            Ok(summary) if summary.cancelled => {
                warn!(
                    uploaded = summary.uploaded.len(),
                    "cancelled while uploading; {} left staged",
                    staged.id
                );
                tracker.files = summary;
                return tracker.abort(AbortReason::Cancelled, Some(&MigrateError::Cancelled));
            }
            Ok(summary) => {
                if !summary.is_clean() {
                    warn!(
                        unavailable = summary.unavailable.len(),
                        failed = summary.failed.len(),
                        "committing with incomplete file set"
                    );
                }
                tracker.files = summary;
            }
            Err(err) => {
                error!(status = err.status(), "failed to list files at {base_url}: {err}");
                return tracker.abort(AbortReason::Failed, Some(&err));
            }
        }
        tracker.advance(MigrationState::FilesUploaded);

        if let Err(err) = self.artifacts.commit(&staged.id).await {
            error!(status = err.status(), "failed to commit {}: {err}", staged.id);
            return tracker.abort(AbortReason::Failed, Some(&err));
        }
        tracker.advance(MigrationState::Committed);
        info!("dataset migrated");
        tracker.finish()
    }
}

struct Tracker<'a> {
    id: DatasetId,
    state: MigrationState,
    files: UploadSummary,
    sink: &'a dyn ProgressSink,
    started: Instant,
}

impl<'a> Tracker<'a> {
    fn new(id: DatasetId, sink: &'a dyn ProgressSink) -> Self {
        Self {
            id,
            state: MigrationState::Start,
            files: UploadSummary::default(),
            sink,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, state: MigrationState) {
        self.state = state;
        self.sink.event(ProgressEvent {
            dataset: Some(self.id.clone()),
            state: Some(state),
            message: format!("state={state}"),
            elapsed: Some(self.started.elapsed()),
        });
    }

    fn finish(self) -> MigrationOutcome {
        MigrationOutcome {
            id: self.id,
            state: self.state,
            reached: self.state,
            reason: None,
            error: None,
            files: self.files,
        }
    }

    fn abort(self, reason: AbortReason, error: Option<&MigrateError>) -> MigrationOutcome {
        self.sink.event(ProgressEvent {
            dataset: Some(self.id.clone()),
            state: Some(MigrationState::Aborted),
            message: format!("state=aborted reached={}", self.state),
            elapsed: Some(self.started.elapsed()),
        });
        MigrationOutcome {
            id: self.id,
            state: MigrationState::Aborted,
            reached: self.state,
            reason: Some(reason),
            error: error.map(ToString::to_string),
            files: self.files,
        }
    }
}
