use crate::errors::{Result, StorageError};
use crate::ident::Identifier;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("geosync/", env!("CARGO_PKG_VERSION"));

/// Process-wide settings. Built once, then shared by reference.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: Identifier,
    #[serde(default = "default_temp_schema")]
    pub temp_schema: Identifier,
    #[serde(default = "default_metadata_table")]
    pub metadata_table: Identifier,
    #[serde(default = "default_geometry_column")]
    pub geometry_column: Identifier,
    /// Role that is granted SELECT on every published table.
    #[serde(default)]
    pub renderuser: Option<Identifier>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_convert_timeout")]
    pub convert_timeout_secs: u64,
    #[serde(default = "default_ogr2ogr")]
    pub ogr2ogr: PathBuf,
}

fn default_schema() -> Identifier {
    Identifier::trusted("public")
}

fn default_temp_schema() -> Identifier {
    Identifier::trusted("loading")
}

fn default_metadata_table() -> Identifier {
    Identifier::trusted("external_data")
}

fn default_geometry_column() -> Identifier {
    Identifier::trusted("way")
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_convert_timeout() -> u64 {
    3600
}

fn default_ogr2ogr() -> PathBuf {
    PathBuf::from("ogr2ogr")
}

impl Settings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database: None,
            host: None,
            port: None,
            username: None,
            schema: default_schema(),
            temp_schema: default_temp_schema(),
            metadata_table: default_metadata_table(),
            geometry_column: default_geometry_column(),
            renderuser: None,
            user_agent: default_user_agent(),
            fetch_timeout_secs: default_fetch_timeout(),
            convert_timeout_secs: default_convert_timeout(),
            ogr2ogr: default_ogr2ogr(),
        }
    }

    /// Returns a copy with every `Some` override applied.
    pub fn with_overrides(&self, overrides: &SettingsOverrides) -> Self {
        let mut settings = self.clone();
        if let Some(data_dir) = &overrides.data_dir {
            settings.data_dir = data_dir.clone();
        }
        if let Some(database) = &overrides.database {
            settings.database = Some(database.clone());
        }
        if let Some(host) = &overrides.host {
            settings.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            settings.port = Some(port);
        }
        if let Some(username) = &overrides.username {
            settings.username = Some(username.clone());
        }
        if let Some(role) = &overrides.renderuser {
            settings.renderuser = Some(role.clone());
        }
        settings
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn convert_timeout(&self) -> Duration {
        Duration::from_secs(self.convert_timeout_secs)
    }

    /// Connection options for sqlx. Unset fields fall back to the libpq
    /// environment (`PGHOST`, `PGPASSWORD`, ...).
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new().application_name("geosync");
        if let Some(host) = &self.host {
            options = options.host(host);
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        if let Some(username) = &self.username {
            options = options.username(username);
        }
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        options
    }

    /// libpq conninfo string in the `PG:` form understood by GDAL.
    pub fn ogr_connection(&self) -> String {
        let mut parts = Vec::new();
        if let Some(database) = &self.database {
            parts.push(conninfo_pair("dbname", database));
        }
        if let Some(host) = &self.host {
            parts.push(conninfo_pair("host", host));
        }
        if let Some(port) = self.port {
            parts.push(conninfo_pair("port", &port.to_string()));
        }
        if let Some(username) = &self.username {
            parts.push(conninfo_pair("user", username));
        }
        format!("PG:{}", parts.join(" "))
    }
}

fn conninfo_pair(key: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("{key}='{escaped}'")
}

/// Values supplied on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub data_dir: Option<PathBuf>,
    pub database: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub renderuser: Option<Identifier>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Zip,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ArchiveSpec {
    pub format: ArchiveFormat,
    pub files: Vec<String>,
}

/// One external dataset.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: Identifier,
    pub url: String,
    /// Path of the file handed to the converter, relative to the working directory.
    pub file: PathBuf,
    pub archive: Option<ArchiveSpec>,
    /// Extra converter arguments, passed through verbatim.
    pub ogropts: Vec<String>,
}

#[derive(Deserialize)]
struct SourceBody {
    url: String,
    file: PathBuf,
    #[serde(default)]
    archive: Option<ArchiveSpec>,
    #[serde(default)]
    ogropts: Vec<String>,
}

#[derive(Deserialize)]
struct RawConfig {
    settings: Settings,
    #[serde(default)]
    sources: serde_yaml::Mapping,
}

/// A source whose name failed validation. It is never synced, but the
/// remaining sources still are.
#[derive(Debug)]
pub struct RejectedSource {
    pub key: String,
    pub error: StorageError,
}

/// The parsed configuration file. Sources keep their file order.
#[derive(Debug)]
pub struct SyncConfig {
    pub settings: Settings,
    pub sources: Vec<SourceSpec>,
    pub rejected: Vec<RejectedSource>,
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        let mut sources = Vec::with_capacity(raw.sources.len());
        let mut rejected = Vec::new();
        for (key, value) in raw.sources {
            let key = match key.as_str() {
                Some(key) => key.to_string(),
                None => format!("{key:?}"),
            };
            let name = match Identifier::parse(key.as_str()) {
                Ok(name) => name,
                Err(err) => {
                    let error = StorageError::Config(format!("source '{key}': {err}"));
                    log::error!("Skipping source: {error}");
                    rejected.push(RejectedSource { key, error });
                    continue;
                }
            };
            // Anything else wrong with an entry fails the whole configuration.
            let body: SourceBody = serde_yaml::from_value(value)
                .map_err(|err| StorageError::Config(format!("source '{key}': {err}")))?;
            sources.push(SourceSpec::from_body(name, body)?);
        }
        Ok(Self {
            settings: raw.settings,
            sources,
            rejected,
        })
    }

    /// Like [`SyncConfig::from_yaml_str`], but a source with an invalid name
    /// also fails the whole configuration.
    pub fn from_yaml_str_strict(content: &str) -> Result<Self> {
        let mut config = Self::from_yaml_str(content)?;
        match config.rejected.pop() {
            Some(rejected) => Err(rejected.error),
            None => Ok(config),
        }
    }
}

impl SourceSpec {
    fn from_body(name: Identifier, body: SourceBody) -> Result<Self> {
        if body.url.trim().is_empty() {
            return Err(StorageError::Config(format!("source '{name}': url is empty")));
        }
        check_relative(&name, &body.file)?;
        if let Some(archive) = &body.archive {
            if archive.files.is_empty() {
                return Err(StorageError::Config(format!(
                    "source '{name}': archive lists no files to extract"
                )));
            }
            for member in &archive.files {
                check_relative(&name, Path::new(member))?;
            }
        }
        if name.as_str().chars().any(|c| c.is_ascii_uppercase()) {
            log::info!("source '{name}' is stored as table {}", name.folded());
        }
        Ok(Self {
            name,
            url: body.url,
            file: body.file,
            archive: body.archive,
            ogropts: body.ogropts,
        })
    }
}

fn check_relative(name: &Identifier, path: &Path) -> Result<()> {
    let normal = path.components().count() > 0
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if normal {
        Ok(())
    } else {
        Err(StorageError::Config(format!(
            "source '{name}': path {} must stay inside the working directory",
            path.display()
        )))
    }
}
