use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::artifact::{Artifact, ArtifactService, CreateRequest};
use crate::catalog::{self, SUMMARY_FIELDS};
use crate::config::ResolvedConfig;
use crate::domain::{Catalog, CatalogEntry, DatasetId, Lookup, Manifest, MigrationState};
use crate::error::MigrateError;
use crate::manifest::ManifestSource;
use crate::migrator::{AbortReason, DatasetMigrator, MigrationOutcome};
use crate::scheduler::WorkerPool;
use crate::storage::{self, FileIndex, POTREE_EXTENSION, SMLM_EXTENSION};
use crate::transfer::Transport;
use crate::uploader::content_url;

pub const COLLECTION_NAME: &str = "ShareLoc.XYZ";
pub const COLLECTION_DESCRIPTION: &str =
    "ShareLoc.XYZ -- A Repository for Sharing Single Molecular Localization Microscopy Data";
pub const COLLECTION_PUBLISH_TARGET: &str = "sandbox_zenodo";

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub dataset: Option<DatasetId>,
    pub state: Option<MigrationState>,
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub committed: usize,
    pub already_migrated: usize,
    pub aborted: usize,
    pub outcomes: Vec<MigrationOutcome>,
}

impl RunReport {
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcomes: Vec<MigrationOutcome>,
    ) -> Self {
        let committed = outcomes.iter().filter(|o| o.is_committed()).count();
        let already_migrated = outcomes
            .iter()
            .filter(|o| o.reason == Some(AbortReason::AlreadyMigrated))
            .count();
        Self {
            started_at,
            finished_at,
            total: outcomes.len(),
            committed,
            already_migrated,
            aborted: outcomes.len() - committed - already_migrated,
            outcomes,
        }
    }

    pub fn outcome(&self, id: &str) -> Option<&MigrationOutcome> {
        self.outcomes.iter().find(|o| o.id.as_str() == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairOutcome {
    pub id: String,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub collection: String,
    pub outcomes: Vec<RepairOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResult {
    pub json_path: Utf8PathBuf,
    pub yaml_path: Utf8PathBuf,
    pub datasets: usize,
    pub skipped: Vec<String>,
    pub pending_derivatives: usize,
    pub staged_sources: usize,
}

/// Where converted point-cloud derivatives live, and what to do about missing ones.
#[derive(Debug, Clone)]
pub struct DerivativeCheck {
    /// Listing URL of the derivatives store.
    pub listing_url: String,
    /// Public prefix of converted objects; keys absent from the listing are
    /// probed here with HEAD before being reported as pending.
    pub object_url: String,
    /// Sources of pending derivatives are downloaded below this directory.
    pub staging_dir: Option<Utf8PathBuf>,
}

/// Collection driver: owns the migrator and the worker pool.
pub struct App<M, A, I, T>
where
    M: ManifestSource,
    A: ArtifactService,
    I: FileIndex,
    T: Transport,
{
    migrator: Arc<DatasetMigrator<M, A, I, T>>,
    pool: WorkerPool,
}

impl<M, A, I, T> App<M, A, I, T>
where
    M: ManifestSource + 'static,
    A: ArtifactService + 'static,
    I: FileIndex + 'static,
    T: Transport + 'static,
{
    pub fn new(migrator: DatasetMigrator<M, A, I, T>, pool: WorkerPool) -> Self {
        Self {
            migrator: Arc::new(migrator),
            pool,
        }
    }

    pub fn migrator(&self) -> &DatasetMigrator<M, A, I, T> {
        &self.migrator
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Creates (or overwrites) the parent collection the datasets live in.
    pub async fn ensure_collection(
        &self,
        config: &ResolvedConfig,
    ) -> Result<Artifact, MigrateError> {
        let request = CreateRequest {
            alias: config.collection_alias.clone(),
            artifact_type: "collection".to_string(),
            parent_id: None,
            manifest: json!({
                "name": COLLECTION_NAME,
                "description": COLLECTION_DESCRIPTION,
            }),
            version: None,
            overwrite: true,
            config: Some(json!({ "permissions": { "*": "r", "@": "r+" } })),
            secrets: config.secrets.clone(),
            publish_to: Some(COLLECTION_PUBLISH_TARGET.to_string()),
        };
        self.migrator.artifacts().create(request).await?;
        match self
            .migrator
            .artifacts()
            .read(&config.collection_id())
            .await?
        {
            Lookup::Found(collection) => {
                info!(collection = %collection.id, "collection ready");
                Ok(collection)
            }
            Lookup::NotFound => Err(MigrateError::Reconciliation(format!(
                "collection {} missing right after creation",
                config.collection_id()
            ))),
        }
    }

    /// Migrates every entry under the worker pool and waits for all of them.
    pub async fn migrate_collection(
        &self,
        entries: Vec<CatalogEntry>,
        sink: Arc<dyn ProgressSink>,
    ) -> RunReport {
        let started_at = Utc::now();
        info!(
            entries = entries.len(),
            workers = self.pool.workers(),
            "starting migration"
        );

        let ids: Vec<DatasetId> = entries.iter().map(|entry| entry.id.clone()).collect();
        let migrator = Arc::clone(&self.migrator);
        let slots = self
            .pool
            .run(entries, move |entry| {
                let migrator = Arc::clone(&migrator);
                let sink = Arc::clone(&sink);
                async move { migrator.migrate(&entry, sink.as_ref()).await }
            })
            .await;
        let outcomes = ids
            .into_iter()
            .zip(slots)
            .map(|(id, slot)| slot.unwrap_or_else(|| MigrationOutcome::crashed(id)))
            .collect();

        let report = RunReport::new(started_at, Utc::now(), outcomes);
        info!(
            total = report.total,
            committed = report.committed,
            already_migrated = report.already_migrated,
            aborted = report.aborted,
            "migration completed"
        );
        report
    }

    /// Re-edits and re-commits every child of the collection.
    pub async fn repair_collection(
        &self,
        collection_id: &str,
    ) -> Result<RepairReport, MigrateError> {
        let artifacts = self.migrator.artifacts();
        let collection = match artifacts.read(collection_id).await? {
            Lookup::Found(collection) => collection,
            Lookup::NotFound => {
                return Err(MigrateError::Reconciliation(format!(
                    "collection {collection_id} does not exist"
                )));
            }
        };
        let children = artifacts.list_children(&collection.id).await?;
        info!(collection = %collection.id, children = children.len(), "repairing collection");

        let ids: Vec<String> = children.iter().map(|child| child.id.clone()).collect();
        let migrator = Arc::clone(&self.migrator);
        let slots = self
            .pool
            .run(children, move |child| {
                let migrator = Arc::clone(&migrator);
                async move {
                    let result = repair_artifact(migrator.artifacts(), &child.id).await;
                    match result {
                        Ok(()) => {
                            info!(artifact = %child.id, "artifact repaired");
                            RepairOutcome {
                                id: child.id,
                                repaired: true,
                                error: None,
                            }
                        }
                        Err(err) => {
                            error!(artifact = %child.id, status = err.status(), "failed to repair: {err}");
                            RepairOutcome {
                                id: child.id,
                                repaired: false,
                                error: Some(err.to_string()),
                            }
                        }
                    }
                }
            })
            .await;
        let outcomes: Vec<RepairOutcome> = ids
            .into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                slot.unwrap_or_else(|| RepairOutcome {
                    id,
                    repaired: false,
                    error: Some("repair task panicked".to_string()),
                })
            })
            .collect();

        info!(
            repaired = outcomes.iter().filter(|o| o.repaired).count(),
            failed = outcomes.iter().filter(|o| !o.repaired).count(),
            "collection repair completed"
        );
        Ok(RepairReport {
            collection: collection.id,
            outcomes,
        })
    }

    /// Builds the published collection summary from the live manifests.
    pub async fn summarize(
        &self,
        catalog: Catalog,
        output_dir: &Utf8Path,
        derivatives: Option<&DerivativeCheck>,
    ) -> Result<SummaryResult, MigrateError> {
        let stored = match derivatives {
            Some(check) => self.migrator.index().list(&check.listing_url).await?,
            None => BTreeSet::new(),
        };

        let mut summaries = Vec::new();
        let mut skipped = Vec::new();
        let mut pending_derivatives = 0usize;
        let mut staged_sources = 0usize;
        for entry in catalog.collection {
            if entry.is_blocked() {
                info!(id = %entry.id, doi = %entry.doi, "skipping blocked entry");
                skipped.push(entry.id.to_string());
                continue;
            }
            let mut manifest = match self.migrator.manifests().fetch(&entry.rdf_source).await {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!(id = %entry.id, status = err.status(), "could not get item: {err}");
                    skipped.push(entry.id.to_string());
                    continue;
                }
            };
            manifest.overlay(entry.overrides());

            if let Some(check) = derivatives {
                let (pending, staged) = self
                    .check_derivatives(check, &stored, &entry, &manifest)
                    .await;
                pending_derivatives += pending;
                staged_sources += staged;
            }

            summaries.push(catalog::summarize_manifest(&manifest));
        }

        catalog::sort_summaries(&mut summaries);
        let datasets = summaries.len();
        info!(datasets, fields = SUMMARY_FIELDS.len(), "writing collection summary");
        let (json_path, yaml_path) = catalog::write_summary(&catalog.rest, summaries, output_dir)?;
        Ok(SummaryResult {
            json_path,
            yaml_path,
            datasets,
            skipped,
            pending_derivatives,
            staged_sources,
        })
    }

    /// Returns `(pending, staged)` for one dataset.
    async fn check_derivatives(
        &self,
        check: &DerivativeCheck,
        stored: &BTreeSet<String>,
        entry: &CatalogEntry,
        manifest: &Manifest,
    ) -> (usize, usize) {
        let candidates = storage::pending_derivatives(
            &entry.doi,
            &manifest.attachments(),
            stored,
            SMLM_EXTENSION,
            POTREE_EXTENSION,
        );

        let mut pending = 0usize;
        let mut staged = 0usize;
        for candidate in candidates {
            let object = format!("{}/{}", check.object_url.trim_end_matches('/'), candidate.key);
            match self.migrator.index().exists(&object).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => warn!(id = %entry.id, "could not probe {object}: {err}"),
            }
            pending += 1;

            let Some(staging_dir) = &check.staging_dir else {
                continue;
            };
            let destination = staging_dir
                .join(entry.doi.as_str())
                .join(&candidate.source_path);
            let source = content_url(&entry.content_base_url(), &candidate.source_path);
            match self
                .migrator
                .transfer()
                .download(&source, destination.as_std_path())
                .await
            {
                Ok(report) => {
                    info!(id = %entry.id, file = %candidate.source_path, bytes = report.bytes, "source staged for conversion");
                    staged += 1;
                }
                Err(err) => {
                    error!(id = %entry.id, file = %candidate.source_path, status = err.status(), "{err}");
                }
            }
        }
        if pending > 0 {
            info!(id = %entry.id, pending, "derivatives not yet converted");
        }
        (pending, staged)
    }
}

async fn repair_artifact<A: ArtifactService>(
    artifacts: &A,
    artifact_id: &str,
) -> Result<(), MigrateError> {
    let full = match artifacts.read(artifact_id).await? {
        Lookup::Found(full) => full,
        Lookup::NotFound => {
            return Err(MigrateError::Reconciliation(format!(
                "{artifact_id} vanished during repair"
            )));
        }
    };
    let manifest = match full.manifest {
        Value::Object(_) => full.manifest,
        Value::Null => {
            return Err(MigrateError::Reconciliation(format!(
                "{artifact_id} has no manifest"
            )));
        }
        other => {
            return Err(MigrateError::Reconciliation(format!(
                "{artifact_id} manifest is not a mapping: {other}"
            )));
        }
    };
    artifacts.edit(artifact_id, &manifest).await?;
    let committed = artifacts.commit(artifact_id).await?;
    if committed.versions.is_empty() {
        return Err(MigrateError::Reconciliation(format!(
            "{artifact_id} has no versions after commit"
        )));
    }
    Ok(())
}

/// Forwards progress events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        let elapsed_ms = event.elapsed.map(|elapsed| elapsed.as_millis() as u64);
        match &event.dataset {
            Some(id) => tracing::debug!(dataset = %id, elapsed_ms, "{}", event.message),
            None => tracing::debug!(elapsed_ms, "{}", event.message),
        }
    }
}
