use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::Lookup;
use crate::error::MigrateError;

pub const ARTIFACT_MANAGER_SERVICE: &str = "public/services/artifact-manager";
pub const STAGE_VERSION: &str = "stage";

/// Artifact as returned by the artifact manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, rename = "type")]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub manifest: Value,
    #[serde(default)]
    pub versions: Vec<Value>,
    #[serde(default)]
    pub staging: Option<Value>,
}

impl Artifact {
    pub fn from_value(value: Value) -> Result<Self, MigrateError> {
        let artifact: Artifact = serde_json::from_value(value)
            .map_err(|err| MigrateError::Reconciliation(err.to_string()))?;
        if artifact.id.trim().is_empty() {
            return Err(MigrateError::Reconciliation(
                "artifact without id".to_string(),
            ));
        }
        Ok(artifact)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateRequest {
    pub alias: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub manifest: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub overwrite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_to: Option<String>,
}

impl CreateRequest {
    /// Dataset child staged under `parent_id`, replacing any previous stage.
    pub fn staged_dataset(alias: &str, parent_id: &str, manifest: Value) -> Self {
        Self {
            alias: alias.to_string(),
            artifact_type: "dataset".to_string(),
            parent_id: Some(parent_id.to_string()),
            manifest,
            version: Some(STAGE_VERSION.to_string()),
            overwrite: true,
            config: None,
            secrets: BTreeMap::new(),
            publish_to: None,
        }
    }
}

/// Client side of the artifact manager protocol.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn read(&self, artifact_id: &str) -> Result<Lookup<Artifact>, MigrateError>;
    async fn create(&self, request: CreateRequest) -> Result<Artifact, MigrateError>;
    async fn edit(&self, artifact_id: &str, manifest: &Value) -> Result<Artifact, MigrateError>;
    async fn commit(&self, artifact_id: &str) -> Result<Artifact, MigrateError>;
    async fn get_file(
        &self,
        artifact_id: &str,
        file_path: &str,
    ) -> Result<Lookup<String>, MigrateError>;
    async fn put_file(
        &self,
        artifact_id: &str,
        file_path: &str,
        download_weight: f64,
    ) -> Result<String, MigrateError>;
    /// Children of a collection, staged ones included.
    async fn list_children(&self, parent_id: &str) -> Result<Vec<Artifact>, MigrateError>;
}

#[derive(Clone)]
pub struct HyphaArtifactClient {
    client: Client,
    base_url: String,
}

impl HyphaArtifactClient {
    pub fn new(
        server_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, MigrateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("shareloc-migrate/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MigrateError::InvalidSetting(err.to_string()))?,
        );
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            let mut auth = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                MigrateError::InvalidSetting("WORKSPACE_TOKEN is not a valid header value".to_string())
            })?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MigrateError::ArtifactHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: format!(
                "{}/{ARTIFACT_MANAGER_SERVICE}",
                server_url.trim_end_matches('/')
            ),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn call(&self, method: &str, kwargs: Value) -> Result<Value, MigrateError> {
        let url = self.method_url(method);
        debug!(method, "artifact manager call");
        let response = self
            .client
            .post(&url)
            .json(&kwargs)
            .send()
            .await
            .map_err(|err| MigrateError::ArtifactHttp(format!("{method}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| format!("{method} failed"));
            return Err(MigrateError::ArtifactStatus {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|err| MigrateError::ArtifactHttp(format!("{method}: {err}")))
    }

    async fn lookup(&self, method: &str, kwargs: Value) -> Result<Lookup<Value>, MigrateError> {
        match self.call(method, kwargs).await {
            Ok(value) => Ok(Lookup::Found(value)),
            Err(MigrateError::ArtifactStatus { status, message })
                if is_not_found(status, &message) =>
            {
                Ok(Lookup::NotFound)
            }
            Err(err) => Err(err),
        }
    }
}

/// The artifact manager reports missing artifacts and files either as 404 or
/// as a generic error whose detail names the missing object.
pub fn is_not_found(status: u16, message: &str) -> bool {
    if status == 404 {
        return true;
    }
    let lowered = message.to_ascii_lowercase();
    (400..600).contains(&status)
        && (lowered.contains("not found")
            || lowered.contains("does not exist")
            || lowered.contains("keyerror"))
}

fn expect_url(value: Value, method: &str) -> Result<String, MigrateError> {
    match value {
        Value::String(url) if !url.is_empty() => Ok(url),
        other => Err(MigrateError::Reconciliation(format!(
            "{method} returned {other} instead of a URL"
        ))),
    }
}

#[async_trait]
impl ArtifactService for HyphaArtifactClient {
    async fn read(&self, artifact_id: &str) -> Result<Lookup<Artifact>, MigrateError> {
        match self
            .lookup("read", json!({ "artifact_id": artifact_id }))
            .await?
        {
            Lookup::Found(value) => Ok(Lookup::Found(Artifact::from_value(value)?)),
            Lookup::NotFound => Ok(Lookup::NotFound),
        }
    }

    async fn create(&self, request: CreateRequest) -> Result<Artifact, MigrateError> {
        let kwargs = serde_json::to_value(&request)
            .map_err(|err| MigrateError::ArtifactHttp(err.to_string()))?;
        Artifact::from_value(self.call("create", kwargs).await?)
    }

    async fn edit(&self, artifact_id: &str, manifest: &Value) -> Result<Artifact, MigrateError> {
        let kwargs = json!({ "artifact_id": artifact_id, "manifest": manifest });
        Artifact::from_value(self.call("edit", kwargs).await?)
    }

    async fn commit(&self, artifact_id: &str) -> Result<Artifact, MigrateError> {
        let kwargs = json!({ "artifact_id": artifact_id });
        Artifact::from_value(self.call("commit", kwargs).await?)
    }

    async fn get_file(
        &self,
        artifact_id: &str,
        file_path: &str,
    ) -> Result<Lookup<String>, MigrateError> {
        let kwargs = json!({ "artifact_id": artifact_id, "file_path": file_path });
        match self.lookup("get_file", kwargs).await? {
            Lookup::Found(value) => Ok(Lookup::Found(expect_url(value, "get_file")?)),
            Lookup::NotFound => Ok(Lookup::NotFound),
        }
    }

    async fn put_file(
        &self,
        artifact_id: &str,
        file_path: &str,
        download_weight: f64,
    ) -> Result<String, MigrateError> {
        let kwargs = json!({
            "artifact_id": artifact_id,
            "file_path": file_path,
            "download_weight": download_weight,
        });
        expect_url(self.call("put_file", kwargs).await?, "put_file")
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<Artifact>, MigrateError> {
        let kwargs = json!({ "parent_id": parent_id, "stage": Value::Null });
        match self.call("list", kwargs).await? {
            Value::Array(items) => items.into_iter().map(Artifact::from_value).collect(),
            other => Err(MigrateError::Reconciliation(format!(
                "list returned {other} instead of a sequence"
            ))),
        }
    }
}
