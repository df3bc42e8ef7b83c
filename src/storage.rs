use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONNECTION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use crate::domain::{Attachments, Doi};
use crate::error::MigrateError;

pub const SMLM_EXTENSION: &str = ".smlm";
pub const POTREE_EXTENSION: &str = ".potree.zip";

const MAX_LISTING_PAGES: usize = 1000;

#[async_trait]
pub trait FileIndex: Send + Sync {
    /// Every object key stored under `prefix`, across all listing pages.
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, MigrateError>;

    /// Whether a single object answers a HEAD request successfully.
    async fn exists(&self, url: &str) -> Result<bool, MigrateError>;
}

#[derive(Debug, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub entries: Vec<ListingEntry>,
    #[serde(default)]
    pub links: Option<ListingLinks>,
}

#[derive(Debug, Deserialize)]
pub struct ListingEntry {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct ListingLinks {
    #[serde(default)]
    pub next: Option<String>,
}

impl ListingPage {
    /// Continuation link; an unset or empty link means the listing is exhaustive.
    pub fn next_page(&self) -> Option<&str> {
        self.links
            .as_ref()
            .and_then(|links| links.next.as_deref())
            .filter(|next| !next.is_empty())
    }
}

#[derive(Clone)]
pub struct HttpFileIndex {
    client: Client,
}

impl HttpFileIndex {
    pub fn new(timeout: Duration) -> Result<Self, MigrateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("shareloc-migrate/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MigrateError::InvalidSetting(err.to_string()))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MigrateError::StorageHttp(err.to_string()))?;
        Ok(Self { client })
    }

    async fn fetch_page(&self, url: &str) -> Result<ListingPage, MigrateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| MigrateError::StorageHttp(format!("{url}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| format!("listing {url} failed"));
            return Err(MigrateError::StorageStatus {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|err| MigrateError::StorageHttp(format!("{url}: {err}")))
    }
}

#[async_trait]
impl FileIndex for HttpFileIndex {
    async fn list(&self, prefix: &str) -> Result<BTreeSet<String>, MigrateError> {
        let mut keys = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut next = Some(prefix.to_string());

        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) || visited.len() > MAX_LISTING_PAGES {
                break;
            }
            let page = self.fetch_page(&url).await?;
            keys.extend(page.entries.iter().map(|entry| entry.key.clone()));
            next = page.next_page().map(str::to_string);
        }

        debug!(prefix, count = keys.len(), "listed stored objects");
        Ok(keys)
    }

    async fn exists(&self, url: &str) -> Result<bool, MigrateError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|err| MigrateError::StorageHttp(format!("{url}: {err}")))?;
        Ok(response.status().is_success())
    }
}

/// Object key of the converted copy of `sample/file`, if the file has `from_ext`.
pub fn derivative_key(
    doi: &Doi,
    sample: &str,
    file: &str,
    from_ext: &str,
    to_ext: &str,
) -> Option<String> {
    let stem = file.strip_suffix(from_ext)?;
    Some(format!("{}/{sample}/{stem}{to_ext}", doi.as_str()))
}

/// A `.smlm` sample file whose converted copy is missing from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDerivative {
    /// `sample/file`, relative to the dataset's content listing.
    pub source_path: String,
    pub key: String,
}

/// Sample files whose converted copy is not yet among `stored_keys`.
pub fn pending_derivatives(
    doi: &Doi,
    attachments: &Attachments,
    stored_keys: &BTreeSet<String>,
    from_ext: &str,
    to_ext: &str,
) -> Vec<PendingDerivative> {
    let mut pending = Vec::new();
    for sample in &attachments.samples {
        for file in &sample.files {
            let Some(key) = derivative_key(doi, &sample.name, &file.name, from_ext, to_ext) else {
                continue;
            };
            if !stored_keys.contains(&key) {
                pending.push(PendingDerivative {
                    source_path: format!("{}/{}", sample.name, file.name),
                    key,
                });
            }
        }
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_without_next_link_is_exhaustive() {
        let page: ListingPage =
            serde_json::from_str(r#"{"entries": [{"key": "rdf.yaml"}], "links": {"self": "x"}}"#)
                .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert!(page.next_page().is_none());

        let page: ListingPage = serde_json::from_str(
            r#"{"entries": [], "links": {"next": "https://zenodo.org/api/records/1/files?page=2"}}"#,
        )
        .unwrap();
        assert_eq!(
            page.next_page(),
            Some("https://zenodo.org/api/records/1/files?page=2")
        );
    }

    #[test]
    fn derivative_key_replaces_extension() {
        let doi: Doi = "10.5281/zenodo.42".parse().unwrap();
        assert_eq!(
            derivative_key(&doi, "s1", "data.smlm", SMLM_EXTENSION, POTREE_EXTENSION).as_deref(),
            Some("10.5281/zenodo.42/s1/data.potree.zip")
        );
        assert!(derivative_key(&doi, "s1", "cover.png", SMLM_EXTENSION, POTREE_EXTENSION).is_none());
    }

    #[test]
    fn converted_files_are_not_pending() {
        use crate::domain::{Sample, SampleFile};

        let doi: Doi = "10.5281/zenodo.42".parse().unwrap();
        let attachments = Attachments {
            samples: vec![Sample {
                name: "s1".to_string(),
                files: ["a.smlm", "b.smlm", "notes.txt"]
                    .iter()
                    .map(|name| SampleFile {
                        name: name.to_string(),
                    })
                    .collect(),
            }],
        };
        let stored = BTreeSet::from(["10.5281/zenodo.42/s1/a.potree.zip".to_string()]);

        let pending =
            pending_derivatives(&doi, &attachments, &stored, SMLM_EXTENSION, POTREE_EXTENSION);

        assert_eq!(
            pending,
            vec![PendingDerivative {
                source_path: "s1/b.smlm".to_string(),
                key: "10.5281/zenodo.42/s1/b.potree.zip".to_string(),
            }]
        );
    }
}
