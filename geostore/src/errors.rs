use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("PostgreSQL operation failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Journal operation failed: {0}")]
    Journal(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier {0:?}: only ASCII alphanumeric and underscore characters are supported")]
    InvalidIdentifier(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Upstream returned HTTP {0}")]
    Status(u16),

    #[error("Archive extraction failed: {0}")]
    Extraction(String),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Conversion failed ({status}):\n{output}")]
    Conversion { status: String, output: String },

    #[error("Source '{0}' is being synchronized by another process")]
    Busy(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
