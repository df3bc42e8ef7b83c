use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::domain::{Catalog, CatalogEntry, Manifest};
use crate::error::MigrateError;
use crate::manifest::{HttpManifestFetcher, parse_document};

/// Manifest keys kept in the published collection summary.
pub const SUMMARY_FIELDS: &[&str] = &[
    "authors",
    "badges",
    "covers",
    "description",
    "download_url",
    "github_repo",
    "icon",
    "id",
    "license",
    "links",
    "name",
    "rdf_source",
    "source",
    "tags",
    "type",
    "doi",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    File(Utf8PathBuf),
    Url(String),
}

impl CatalogSource {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            CatalogSource::Url(trimmed.to_string())
        } else {
            CatalogSource::File(Utf8PathBuf::from(trimmed))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CatalogSource::File(path) => path.to_string(),
            CatalogSource::Url(url) => url.clone(),
        }
    }
}

/// Parses a catalog document; malformed entries are skipped with a warning.
pub fn parse_catalog(text: &str) -> Result<Catalog, MigrateError> {
    let document =
        parse_document(text).map_err(|err| MigrateError::CatalogParse(err.to_string()))?;
    catalog_from_value(document)
}

pub fn catalog_from_value(document: Value) -> Result<Catalog, MigrateError> {
    let Value::Object(mut rest) = document else {
        return Err(MigrateError::CatalogParse(
            "catalog document must be a mapping".to_string(),
        ));
    };
    let items = match rest.remove("collection") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => {
            return Err(MigrateError::CatalogParse(
                "missing `collection` list".to_string(),
            ));
        }
        Some(_) => {
            return Err(MigrateError::CatalogParse(
                "`collection` must be a list".to_string(),
            ));
        }
    };

    let mut collection = Vec::with_capacity(items.len());
    for (position, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<CatalogEntry>(item) {
            Ok(entry) => collection.push(entry),
            Err(err) => warn!(position, "skipping malformed catalog entry: {err}"),
        }
    }
    Ok(Catalog { collection, rest })
}

pub async fn load_catalog(
    source: &CatalogSource,
    fetcher: &HttpManifestFetcher,
) -> Result<Catalog, MigrateError> {
    let catalog = match source {
        CatalogSource::File(path) => {
            let text = fs::read_to_string(path.as_std_path())
                .map_err(|err| MigrateError::CatalogRead(format!("{path}: {err}")))?;
            parse_catalog(&text)?
        }
        CatalogSource::Url(url) => catalog_from_value(fetcher.fetch_document(url).await?)?,
    };
    info!(
        source = %source.describe(),
        entries = catalog.collection.len(),
        "catalog loaded"
    );
    Ok(catalog)
}

/// Keeps only [`SUMMARY_FIELDS`] of an overlaid manifest.
pub fn summarize_manifest(manifest: &Manifest) -> Map<String, Value> {
    manifest
        .fields()
        .iter()
        .filter(|(key, _)| SUMMARY_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Newest (highest numeric id) first; non-numeric ids go last.
pub fn sort_summaries(summaries: &mut [Map<String, Value>]) {
    summaries.sort_by_key(|summary| std::cmp::Reverse(summary_id(summary)));
}

fn summary_id(summary: &Map<String, Value>) -> Option<u64> {
    match summary.get("id")? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Writes `collection.json` and `collection.yaml`, keeping the catalog's
/// other top-level keys.
pub fn write_summary(
    rest: &Map<String, Value>,
    summaries: Vec<Map<String, Value>>,
    output_dir: &Utf8Path,
) -> Result<(Utf8PathBuf, Utf8PathBuf), MigrateError> {
    fs::create_dir_all(output_dir.as_std_path())
        .map_err(|err| MigrateError::Filesystem(format!("{output_dir}: {err}")))?;

    let mut document = rest.clone();
    document.insert(
        "collection".to_string(),
        Value::Array(summaries.into_iter().map(Value::Object).collect()),
    );
    let document = Value::Object(document);

    let json_path = output_dir.join("collection.json");
    let json = serde_json::to_vec(&document)
        .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
    fs::write(json_path.as_std_path(), json)
        .map_err(|err| MigrateError::Filesystem(format!("{json_path}: {err}")))?;

    let yaml_path = output_dir.join("collection.yaml");
    let yaml = serde_yaml::to_string(&document)
        .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
    fs::write(yaml_path.as_std_path(), yaml)
        .map_err(|err| MigrateError::Filesystem(format!("{yaml_path}: {err}")))?;

    Ok((json_path, yaml_path))
}
