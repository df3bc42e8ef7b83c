use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;

use shareloc_migrator::config::{
    Config, ConfigLoader, DEFAULT_CATALOG_URL, Overrides, REQUIRED_COLLECTION_SECRETS,
};
use shareloc_migrator::error::MigrateError;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

#[test]
fn file_values_then_cli_overrides() {
    let config = Config {
        catalog: Some("catalog.yaml".to_string()),
        concurrency: Some(4),
        max_retries: Some(3),
        retry_delay_secs: Some(1),
        skip_migrated: Some(false),
        ..Config::default()
    };
    let overrides = Overrides {
        concurrency: Some(16),
        skip_migrated: Some(true),
        ..Overrides::default()
    };

    let resolved = ConfigLoader::resolve_config(config, overrides, env_of(&[])).unwrap();

    assert_eq!(resolved.catalog, "catalog.yaml");
    assert_eq!(resolved.concurrency, 16);
    assert!(resolved.skip_migrated);
    assert_eq!(resolved.retry.max_retries, 3);
    assert_eq!(resolved.retry.base_delay, Duration::from_secs(1));
}

#[test]
fn missing_token_is_a_configuration_error() {
    let resolved =
        ConfigLoader::resolve_config(Config::default(), Overrides::default(), env_of(&[]))
            .unwrap();
    assert_eq!(resolved.catalog, DEFAULT_CATALOG_URL);

    let err = resolved.validate(false).unwrap_err();

    assert!(err.is_configuration());
    assert_matches!(err, MigrateError::MissingSetting(name) if name == "WORKSPACE_TOKEN");
}

#[test]
fn blank_token_counts_as_missing() {
    let resolved = ConfigLoader::resolve_config(
        Config::default(),
        Overrides::default(),
        env_of(&[("WORKSPACE_TOKEN", "  ")]),
    )
    .unwrap();

    assert!(resolved.token.is_none());
}

#[test]
fn collection_secrets_only_required_when_creating() {
    let resolved = ConfigLoader::resolve_config(
        Config::default(),
        Overrides::default(),
        env_of(&[("WORKSPACE_TOKEN", "secret"), ("S3_BUCKET", "shareloc")]),
    )
    .unwrap();

    resolved.validate(false).unwrap();
    let err = resolved.validate(true).unwrap_err();
    assert_matches!(err, MigrateError::MissingSetting(name) if name == REQUIRED_COLLECTION_SECRETS[0]);
    assert_eq!(resolved.secrets.get("S3_BUCKET").map(String::as_str), Some("shareloc"));
}

#[test]
fn zero_concurrency_is_rejected() {
    let config = Config {
        concurrency: Some(0),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(
        config,
        Overrides::default(),
        env_of(&[("WORKSPACE_TOKEN", "secret")]),
    )
    .unwrap();

    assert_matches!(resolved.validate(false), Err(MigrateError::InvalidSetting(_)));
}

#[test]
fn non_http_server_is_rejected() {
    let config = Config {
        server_url: Some("hypha.aicell.io".to_string()),
        ..Config::default()
    };

    let err = ConfigLoader::resolve_config(config, Overrides::default(), env_of(&[])).unwrap_err();

    assert_matches!(err, MigrateError::InvalidSetting(_));
}

#[test]
fn explicit_config_path_must_exist() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("missing.json");

    let err = ConfigLoader::load(path.to_str()).unwrap_err();

    assert_matches!(err, MigrateError::ConfigRead(_));
}

#[test]
fn config_file_is_parsed_strictly() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("shareloc-migrate.json");
    std::fs::write(&path, r#"{"workspace": "sandbox", "concurrency": 3}"#).unwrap();

    let config = ConfigLoader::load(path.to_str()).unwrap();
    assert_eq!(config.workspace.as_deref(), Some("sandbox"));
    assert_eq!(config.concurrency, Some(3));

    std::fs::write(&path, r#"{"workers": 3}"#).unwrap();
    let err = ConfigLoader::load(path.to_str()).unwrap_err();
    assert_matches!(err, MigrateError::ConfigParse(_));
}
