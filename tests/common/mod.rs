#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use shareloc_migrator::app::{ProgressEvent, ProgressSink};
use shareloc_migrator::artifact::{Artifact, ArtifactService, CreateRequest};
use shareloc_migrator::domain::{CatalogEntry, Lookup, Manifest, MigrationState};
use shareloc_migrator::error::MigrateError;
use shareloc_migrator::manifest::ManifestSource;
use shareloc_migrator::migrator::{DatasetMigrator, MigratorSettings};
use shareloc_migrator::storage::FileIndex;
use shareloc_migrator::transfer::{AttemptOutcome, RetryPolicy, RetryingTransfer, Sleeper, Transport};

pub const WORKSPACE: &str = "shareloc-xyz";
pub const PARENT_ID: &str = "shareloc-xyz/shareloc-collection";

pub fn entry(id: &str, rdf_source: &str) -> CatalogEntry {
    CatalogEntry::new(
        id.parse().unwrap(),
        format!("10.5281/zenodo.{id}").parse().unwrap(),
        rdf_source,
    )
}

pub fn manifest_with_samples(samples: &[(&str, &[&str])]) -> Manifest {
    let samples: Vec<Value> = samples
        .iter()
        .map(|(name, files)| {
            let files: Vec<Value> = files.iter().map(|file| json!({ "name": file })).collect();
            json!({ "name": name, "files": files })
        })
        .collect();
    Manifest::from_value(json!({
        "name": "Test dataset",
        "type": "dataset",
        "attachments": { "samples": samples },
    }))
    .unwrap()
}

#[derive(Clone, Default)]
pub struct MockManifests {
    manifests: Arc<Mutex<HashMap<String, Result<Manifest, u16>>>>,
    fetches: Arc<Mutex<Vec<String>>>,
    crashing: Arc<Mutex<HashSet<String>>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockManifests {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&self, url: &str, manifest: Manifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(manifest));
    }

    pub fn fail(&self, url: &str, status: u16) {
        self.manifests
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(status));
    }

    /// Makes fetches of `url` panic instead of returning.
    pub fn crash_on(&self, url: &str) {
        self.crashing.lock().unwrap().insert(url.to_string());
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for MockManifests {
    async fn fetch(&self, url: &str) -> Result<Manifest, MigrateError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.fetches.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.crashing.lock().unwrap().contains(url) {
            panic!("manifest source crashed on {url}");
        }

        let scripted = self.manifests.lock().unwrap().get(url).cloned();
        match scripted {
            Some(Ok(manifest)) => Ok(manifest),
            Some(Err(status)) => Err(MigrateError::FetchStatus {
                url: url.to_string(),
                status,
            }),
            None => Err(MigrateError::FetchStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

#[derive(Default)]
struct ArtifactState {
    artifacts: HashMap<String, Artifact>,
    files: HashMap<String, BTreeSet<String>>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockArtifacts {
    state: Arc<Mutex<ArtifactState>>,
}

impl MockArtifacts {
    pub fn seed_artifact(&self, alias: &str, manifest: Value) {
        let id = format!("{WORKSPACE}/{alias}");
        let artifact = Artifact {
            id: id.clone(),
            alias: Some(alias.to_string()),
            artifact_type: Some("dataset".to_string()),
            manifest,
            versions: vec![json!({ "version": "v0" })],
            staging: None,
        };
        self.state.lock().unwrap().artifacts.insert(id, artifact);
    }

    pub fn seed_file(&self, alias: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .entry(format!("{WORKSPACE}/{alias}"))
            .or_default()
            .insert(path.to_string());
    }

    /// Marks the file behind a pre-signed URL as stored.
    pub fn complete_upload(&self, put_url: &str) {
        if let Some(rest) = put_url.strip_prefix("mock://upload/") {
            if let Some((artifact_id, path)) = rest.split_once("::") {
                self.state
                    .lock()
                    .unwrap()
                    .files
                    .entry(artifact_id.to_string())
                    .or_default()
                    .insert(path.to_string());
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub fn artifact(&self, alias: &str) -> Option<Artifact> {
        self.state
            .lock()
            .unwrap()
            .artifacts
            .get(&format!("{WORKSPACE}/{alias}"))
            .cloned()
    }

    pub fn files(&self, alias: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&format!("{WORKSPACE}/{alias}"))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactService for MockArtifacts {
    async fn read(&self, artifact_id: &str) -> Result<Lookup<Artifact>, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("read:{artifact_id}"));
        Ok(match state.artifacts.get(artifact_id) {
            Some(artifact) => Lookup::Found(artifact.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, request: CreateRequest) -> Result<Artifact, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create:{}", request.alias));
        let id = format!("{WORKSPACE}/{}", request.alias);
        let versions = state
            .artifacts
            .get(&id)
            .map(|existing| existing.versions.clone())
            .unwrap_or_default();
        let artifact = Artifact {
            id: id.clone(),
            alias: Some(request.alias.clone()),
            artifact_type: Some(request.artifact_type.clone()),
            manifest: request.manifest,
            versions,
            staging: request.version.map(|_| json!([])),
        };
        state.artifacts.insert(id, artifact.clone());
        Ok(artifact)
    }

    async fn edit(&self, artifact_id: &str, manifest: &Value) -> Result<Artifact, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("edit:{artifact_id}"));
        match state.artifacts.get_mut(artifact_id) {
            Some(artifact) => {
                artifact.manifest = manifest.clone();
                Ok(artifact.clone())
            }
            None => Err(MigrateError::ArtifactStatus {
                status: 404,
                message: format!("{artifact_id} does not exist"),
            }),
        }
    }

    async fn commit(&self, artifact_id: &str) -> Result<Artifact, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("commit:{artifact_id}"));
        match state.artifacts.get_mut(artifact_id) {
            Some(artifact) => {
                let next = artifact.versions.len();
                artifact.versions.push(json!({ "version": format!("v{next}") }));
                artifact.staging = None;
                Ok(artifact.clone())
            }
            None => Err(MigrateError::ArtifactStatus {
                status: 404,
                message: format!("{artifact_id} does not exist"),
            }),
        }
    }

    async fn get_file(
        &self,
        artifact_id: &str,
        file_path: &str,
    ) -> Result<Lookup<String>, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("get_file:{file_path}"));
        let stored = state
            .files
            .get(artifact_id)
            .is_some_and(|files| files.contains(file_path));
        Ok(if stored {
            Lookup::Found(format!("mock://download/{artifact_id}::{file_path}"))
        } else {
            Lookup::NotFound
        })
    }

    async fn put_file(
        &self,
        artifact_id: &str,
        file_path: &str,
        _download_weight: f64,
    ) -> Result<String, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("put_file:{file_path}"));
        Ok(format!("mock://upload/{artifact_id}::{file_path}"))
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Artifact>, MigrateError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list:{parent_id}"));
        let mut children: Vec<Artifact> = state
            .artifacts
            .values()
            .filter(|artifact| artifact.id != parent_id)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }
}

#[derive(Clone, Default)]
pub struct MockIndex {
    listings: Arc<Mutex<HashMap<String, BTreeSet<String>>>>,
}

impl MockIndex {
    pub fn insert(&self, prefix: &str, keys: &[&str]) {
        self.listings.lock().unwrap().insert(
            prefix.to_string(),
            keys.iter().map(|key| key.to_string()).collect(),
        );
    }
}

#[async_trait]
impl FileIndex for MockIndex {
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, MigrateError> {
        match self.listings.lock().unwrap().get(prefix) {
            Some(keys) => Ok(keys.clone()),
            None => Err(MigrateError::StorageStatus {
                status: 404,
                message: format!("no listing for {prefix}"),
            }),
        }
    }

    async fn exists(&self, url: &str) -> Result<bool, MigrateError> {
        Ok(self
            .listings
            .lock()
            .unwrap()
            .values()
            .any(|keys| keys.iter().any(|key| url.ends_with(key.as_str()))))
    }
}

/// Uploads succeed unless the source matches one of `failing`.
#[derive(Clone)]
pub struct MockTransport {
    artifacts: MockArtifacts,
    failing: Arc<Mutex<Vec<String>>>,
    cancel_after: Arc<Mutex<Option<(String, CancellationToken)>>>,
    uploads: Arc<Mutex<Vec<(String, String)>>>,
    downloads: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockTransport {
    pub fn new(artifacts: MockArtifacts) -> Self {
        Self {
            artifacts,
            failing: Arc::default(),
            cancel_after: Arc::default(),
            uploads: Arc::default(),
            downloads: Arc::default(),
        }
    }

    pub fn fail_source(&self, fragment: &str) {
        self.failing.lock().unwrap().push(fragment.to_string());
    }

    /// Cancels `token` once an upload from a matching source succeeds.
    pub fn cancel_after(&self, fragment: &str, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((fragment.to_string(), token));
    }

    /// Every attempt, including retried ones.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<(String, String)> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn uploaded_sources(&self) -> BTreeSet<String> {
        self.uploads()
            .into_iter()
            .map(|(source, _)| source)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn download_once(&self, source: &str, destination: &Path) -> AttemptOutcome {
        self.downloads
            .lock()
            .unwrap()
            .push((source.to_string(), destination.display().to_string()));
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(destination, b"smlm").unwrap();
        AttemptOutcome::Success { bytes: Some(4) }
    }

    async fn upload_once(&self, source: &str, destination: &str) -> AttemptOutcome {
        self.uploads
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string()));
        let failing = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| source.contains(fragment.as_str()));
        if failing {
            return AttemptOutcome::Failed {
                status: Some(500),
                message: "upstream error".to_string(),
            };
        }
        self.artifacts.complete_upload(destination);
        if let Some((fragment, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if source.contains(fragment.as_str()) {
                token.cancel();
            }
        }
        AttemptOutcome::Success { bytes: Some(4) }
    }
}

/// Records requested delays instead of sleeping.
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingSink {
    pub fn states(&self, id: &str) -> Vec<MigrationState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.dataset.as_ref().is_some_and(|d| d.as_str() == id))
            .filter_map(|event| event.state)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub manifests: MockManifests,
    pub artifacts: MockArtifacts,
    pub index: MockIndex,
    pub transport: MockTransport,
    pub sleeper: RecordingSleeper,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_manifests(MockManifests::default())
    }

    pub fn with_manifests(manifests: MockManifests) -> Self {
        let artifacts = MockArtifacts::default();
        Self {
            manifests,
            transport: MockTransport::new(artifacts.clone()),
            artifacts,
            index: MockIndex::default(),
            sleeper: RecordingSleeper::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn migrator(
        &self,
        skip_migrated: bool,
    ) -> DatasetMigrator<MockManifests, MockArtifacts, MockIndex, MockTransport> {
        let transfer = RetryingTransfer::with_sleeper(
            self.transport.clone(),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(5),
            },
            Arc::new(self.sleeper.clone()),
            self.cancel.clone(),
        );
        DatasetMigrator::new(
            self.manifests.clone(),
            self.artifacts.clone(),
            self.index.clone(),
            transfer,
            MigratorSettings {
                workspace: WORKSPACE.to_string(),
                parent_id: PARENT_ID.to_string(),
                skip_migrated,
                download_weight: 0.0,
            },
            self.cancel.clone(),
        )
    }
}
