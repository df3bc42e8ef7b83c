use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::MigrateError;
use crate::transfer::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "shareloc-migrate.json";
pub const DEFAULT_SERVER_URL: &str = "https://hypha.aicell.io";
pub const DEFAULT_WORKSPACE: &str = "shareloc-xyz";
pub const DEFAULT_COLLECTION_ALIAS: &str = "shareloc-collection";
pub const DEFAULT_CATALOG_URL: &str = "https://raw.githubusercontent.com/imodpasteur/shareloc-collection/refs/heads/gh-pages/collection.yaml";
pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

pub const TOKEN_VAR: &str = "WORKSPACE_TOKEN";

/// Forwarded as secrets when the parent collection is (re)created.
pub const REQUIRED_COLLECTION_SECRETS: &[&str] = &[
    "SANDBOX_ZENODO_ACCESS_TOKEN",
    "ZENODO_ACCESS_TOKEN",
    "S3_ENDPOINT_URL",
    "S3_ACCESS_KEY_ID",
    "S3_SECRET_ACCESS_KEY",
];
pub const OPTIONAL_COLLECTION_SECRETS: &[&str] = &["S3_REGION_NAME", "S3_BUCKET"];

/// On-disk shape of `shareloc-migrate.json`; every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub collection_alias: Option<String>,
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub skip_migrated: Option<bool>,
}

/// CLI-level overrides, applied after the config file and the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub catalog: Option<String>,
    pub concurrency: Option<usize>,
    pub skip_migrated: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub server_url: String,
    pub workspace: String,
    pub collection_alias: String,
    pub catalog: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub skip_migrated: bool,
    pub token: Option<String>,
    pub secrets: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// Fully qualified id of the parent collection artifact.
    pub fn collection_id(&self) -> String {
        format!("{}/{}", self.workspace, self.collection_alias)
    }

    pub fn require_token(&self) -> Result<&str, MigrateError> {
        self.token
            .as_deref()
            .ok_or_else(|| MigrateError::MissingSetting(TOKEN_VAR.to_string()))
    }

    /// Checks everything a run needs before any network call happens.
    pub fn validate(&self, creating_collection: bool) -> Result<(), MigrateError> {
        self.require_token()?;
        if self.concurrency == 0 {
            return Err(MigrateError::InvalidSetting(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(MigrateError::InvalidSetting(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(MigrateError::InvalidSetting(
                "timeout_secs must be positive".to_string(),
            ));
        }
        if creating_collection {
            for name in REQUIRED_COLLECTION_SECRETS {
                if !self.secrets.contains_key(*name) {
                    return Err(MigrateError::MissingSetting((*name).to_string()));
                }
            }
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>, overrides: Overrides) -> Result<ResolvedConfig, MigrateError> {
        let config = Self::load(path)?;
        Self::resolve_config(config, overrides, |name| std::env::var(name).ok())
    }

    pub fn load(path: Option<&str>) -> Result<Config, MigrateError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.as_std_path().exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| MigrateError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| MigrateError::ConfigParse(err.to_string()))
    }

    /// Merges file values, environment lookups and CLI overrides.
    pub fn resolve_config<E>(
        config: Config,
        overrides: Overrides,
        env: E,
    ) -> Result<ResolvedConfig, MigrateError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        let mut secrets = BTreeMap::new();
        for name in REQUIRED_COLLECTION_SECRETS
            .iter()
            .chain(OPTIONAL_COLLECTION_SECRETS)
        {
            if let Some(value) = lookup(*name) {
                secrets.insert((*name).to_string(), value);
            }
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            base_delay: config
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.base_delay),
        };

        let server_url = config
            .server_url
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
            return Err(MigrateError::InvalidSetting(format!(
                "server_url must be an http(s) URL: {server_url}"
            )));
        }

        Ok(ResolvedConfig {
            server_url: server_url.trim_end_matches('/').to_string(),
            workspace: config
                .workspace
                .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
            collection_alias: config
                .collection_alias
                .unwrap_or_else(|| DEFAULT_COLLECTION_ALIAS.to_string()),
            catalog: overrides
                .catalog
                .or(config.catalog)
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            concurrency: overrides
                .concurrency
                .or(config.concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            retry,
            skip_migrated: overrides
                .skip_migrated
                .or(config.skip_migrated)
                .unwrap_or(false),
            token: lookup(TOKEN_VAR),
            secrets,
        })
    }
}
