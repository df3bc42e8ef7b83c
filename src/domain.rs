use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::MigrateError;

static DOI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^10\.\d{4,9}/\S+$").unwrap());

/// Zenodo concept record id; doubles as the artifact alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value used for catalog ordering; non-numeric ids sort last.
    pub fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = MigrateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !is_valid {
            return Err(MigrateError::InvalidDatasetId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl<'de> Deserialize<'de> for DatasetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        let raw = match Raw::deserialize(deserializer)? {
            Raw::Number(value) => value.to_string(),
            Raw::Text(value) => value,
        };
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Doi(String);

impl Doi {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Doi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Doi {
    type Err = MigrateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let normalized = trimmed
            .strip_prefix("https://doi.org/")
            .or_else(|| trimmed.strip_prefix("doi:"))
            .unwrap_or(trimmed);
        if !DOI_RE.is_match(normalized) {
            return Err(MigrateError::InvalidDoi(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for Doi {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Doi> for String {
    fn from(value: Doi) -> Self {
        value.0
    }
}

/// One record of the catalog document's `collection` list.
///
/// Fields other than the identity keys are operator overrides that win over
/// the fetched manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: DatasetId,
    pub doi: Doi,
    pub rdf_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogEntry {
    pub fn new(id: DatasetId, doi: Doi, rdf_source: impl Into<String>) -> Self {
        Self {
            id,
            doi,
            rdf_source: rdf_source.into(),
            name: None,
            documentation: None,
            covers: Vec::new(),
            status: None,
            extra: Map::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.status.as_deref() == Some("blocked")
    }

    /// Listing URL of the record that hosts the manifest and its files.
    pub fn content_base_url(&self) -> String {
        let source = self.rdf_source.trim_end_matches('/');
        if let Some(base) = source.strip_suffix("/rdf.yaml/content") {
            return base.to_string();
        }
        if let Some(base) = source.strip_suffix("/rdf.yaml") {
            return base.to_string();
        }
        match source.rsplit_once('/') {
            Some((base, _)) => base.to_string(),
            None => source.to_string(),
        }
    }

    /// Every catalog field as a JSON mapping, ready to overlay onto a manifest.
    pub fn overrides(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub collection: Vec<CatalogEntry>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleFile {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: Vec<SampleFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl Attachments {
    /// `sample/file` paths in manifest order.
    pub fn sample_paths(&self) -> Vec<String> {
        self.samples
            .iter()
            .flat_map(|sample| {
                sample
                    .files
                    .iter()
                    .map(move |file| format!("{}/{}", sample.name, file.name))
            })
            .collect()
    }
}

/// Parsed manifest (`rdf.yaml`) of one dataset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Map<String, Value>);

impl Manifest {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn from_value(value: Value) -> Result<Self, MigrateError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(MigrateError::Reconciliation(format!(
                "manifest must be a mapping, got {}",
                value_kind(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Applies catalog overrides; the override wins on key collision.
    pub fn overlay(&mut self, overrides: Map<String, Value>) {
        for (key, value) in overrides {
            self.0.insert(key, value);
        }
    }

    /// Attachments section; malformed or missing sections read as empty.
    pub fn attachments(&self) -> Attachments {
        self.0
            .get("attachments")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn documentation(&self) -> Option<&str> {
        self.0
            .get("documentation")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn covers(&self) -> Vec<String> {
        self.0
            .get("covers")
            .and_then(Value::as_array)
            .map(|covers| {
                covers
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Result of an existence query against a remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Start,
    ManifestFetched,
    Reconciled,
    Staged,
    FilesUploaded,
    Committed,
    Aborted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MigrationState::Start => "start",
            MigrationState::ManifestFetched => "manifest_fetched",
            MigrationState::Reconciled => "reconciled",
            MigrationState::Staged => "staged",
            MigrationState::FilesUploaded => "files_uploaded",
            MigrationState::Committed => "committed",
            MigrationState::Aborted => "aborted",
        };
        write!(f, "{label}")
    }
}

/// Strips leading `./` and `/` markers from a manifest-relative path.
pub fn normalize_relative_path(path: &str) -> &str {
    let mut current = path.trim();
    loop {
        if let Some(rest) = current.strip_prefix("./") {
            current = rest;
        } else if let Some(rest) = current.strip_prefix('/') {
            current = rest;
        } else {
            return current;
        }
    }
}
