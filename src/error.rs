use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MigrateError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid DOI: {0}")]
    InvalidDoi(String),

    #[error("missing required setting {0}")]
    #[diagnostic(help("export the variable or add it to shareloc-migrate.json"))]
    MissingSetting(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read catalog from {0}")]
    CatalogRead(String),

    #[error("failed to parse catalog: {0}")]
    CatalogParse(String),

    #[error("request to {url} failed: {message}")]
    FetchHttp { url: String, message: String },

    #[error("{url} returned status {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("failed to parse manifest from {url}: {message}")]
    ManifestParse { url: String, message: String },

    #[error("transfer {source_url} -> {destination} failed after {attempts} attempts (last status: {})", last_status.map(|status| status.to_string()).unwrap_or_else(|| "none".to_string()))]
    Transfer {
        source_url: String,
        destination: String,
        attempts: u32,
        last_status: Option<u16>,
    },

    #[error("unexpected artifact shape: {0}")]
    Reconciliation(String),

    #[error("artifact service request failed: {0}")]
    ArtifactHttp(String),

    #[error("artifact service returned status {status}: {message}")]
    ArtifactStatus { status: u16, message: String },

    #[error("storage listing request failed: {0}")]
    StorageHttp(String),

    #[error("storage listing returned status {status}: {message}")]
    StorageStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Configuration errors are the only ones allowed to terminate a whole run.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MigrateError::MissingSetting(_)
                | MigrateError::InvalidSetting(_)
                | MigrateError::ConfigRead(_)
                | MigrateError::ConfigParse(_)
        )
    }

    pub fn is_network(&self) -> bool {
        matches!(
            self,
            MigrateError::FetchHttp { .. }
                | MigrateError::FetchStatus { .. }
                | MigrateError::Transfer { .. }
                | MigrateError::ArtifactHttp(_)
                | MigrateError::ArtifactStatus { .. }
                | MigrateError::StorageHttp(_)
                | MigrateError::StorageStatus { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            MigrateError::FetchStatus { status, .. }
            | MigrateError::ArtifactStatus { status, .. }
            | MigrateError::StorageStatus { status, .. } => Some(*status),
            MigrateError::Transfer { last_status, .. } => *last_status,
            _ => None,
        }
    }
}
