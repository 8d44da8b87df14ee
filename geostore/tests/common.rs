#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use geostore::{
    config::{ArchiveFormat, ArchiveSpec, Settings, SourceSpec},
    convert::{ConversionReport, ConvertJob, Converter},
    errors::{Result, StorageError},
    fetch::{FetchOutcome, FetchRequest, SourceFetcher},
    ident::Identifier,
    journal::Journal,
    models::{ChangeToken, TrackedSource},
    sync::Synchronizer,
    warehouse::Warehouse,
};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const JAN_2020: &str = "Wed, 01 Jan 2020 00:00:00 GMT";
pub const FEB_2020: &str = "Sat, 01 Feb 2020 00:00:00 GMT";

// --- Warehouse ---

#[derive(Debug, Clone)]
pub struct StagedTable {
    pub content: Vec<u8>,
    pub indexed: bool,
}

#[derive(Debug, Default)]
pub struct WarehouseState {
    pub staging: HashMap<String, StagedTable>,
    pub published: HashMap<String, Vec<u8>>,
    pub tokens: HashMap<String, Option<String>>,
    pub locked: HashSet<String>,
    pub calls: Vec<String>,
    pub fail_index: bool,
    pub fail_publish: bool,
}

/// In-memory stand-in for PostgreSQL with the same visible semantics:
/// publish either moves the staging table and the token together or changes
/// nothing.
#[derive(Default)]
pub struct FakeWarehouse {
    state: Mutex<WarehouseState>,
}

impl FakeWarehouse {
    pub fn state(&self) -> MutexGuard<'_, WarehouseState> {
        self.state.lock().unwrap()
    }

    /// What the converter does: create and fill the staging table. Like
    /// ogr2ogr without `-overwrite`, it refuses to touch an existing table.
    pub fn load_staging(&self, name: &str, content: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        if state.staging.contains_key(name) {
            return Err(StorageError::Conversion {
                status: "exit code 1".into(),
                output: format!("ERROR 1: Layer {name} already exists"),
            });
        }
        state.staging.insert(
            name.to_string(),
            StagedTable {
                content,
                indexed: false,
            },
        );
        Ok(())
    }

    pub fn published(&self, name: &str) -> Option<Vec<u8>> {
        self.state().published.get(name).cloned()
    }

    pub fn token(&self, name: &str) -> Option<Option<String>> {
        self.state().tokens.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn ensure_schema(&self) -> Result<()> {
        self.state().calls.push("ensure_schema".into());
        Ok(())
    }

    async fn lock_source(&self, name: &Identifier) -> Result<()> {
        let mut state = self.state();
        if !state.locked.insert(name.to_string()) {
            return Err(StorageError::Busy(name.to_string()));
        }
        state.calls.push(format!("lock {name}"));
        Ok(())
    }

    async fn unlock_source(&self, name: &Identifier) -> Result<()> {
        let mut state = self.state();
        state.locked.remove(name.as_str());
        state.calls.push(format!("unlock {name}"));
        Ok(())
    }

    async fn get_token(&self, name: &Identifier) -> Result<Option<ChangeToken>> {
        let mut state = self.state();
        state.calls.push(format!("get_token {name}"));
        Ok(state
            .tokens
            .get(name.as_str())
            .cloned()
            .flatten()
            .map(ChangeToken::new))
    }

    async fn reset_staging_table(&self, name: &Identifier) -> Result<()> {
        let mut state = self.state();
        state.staging.remove(name.as_str());
        state.calls.push(format!("reset_staging {name}"));
        Ok(())
    }

    async fn index_staging_table(&self, name: &Identifier) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("index {name}"));
        if state.fail_index {
            return Err(StorageError::Other(anyhow::anyhow!(
                "function st_geohash(geometry) does not exist"
            )));
        }
        match state.staging.get_mut(name.as_str()) {
            Some(table) => {
                table.indexed = true;
                Ok(())
            }
            None => Err(StorageError::Other(anyhow::anyhow!(
                "relation loading.{name} does not exist"
            ))),
        }
    }

    async fn publish(&self, name: &Identifier, token: Option<&ChangeToken>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("publish {name}"));
        if state.fail_publish {
            return Err(StorageError::Other(anyhow::anyhow!("connection reset")));
        }
        let ready = matches!(state.staging.get(name.as_str()), Some(table) if table.indexed);
        if !ready {
            return Err(StorageError::Other(anyhow::anyhow!(
                "staging table {name} missing or not indexed"
            )));
        }
        let staged = state.staging.remove(name.as_str()).unwrap();
        state.published.insert(name.to_string(), staged.content);
        state
            .tokens
            .insert(name.to_string(), token.map(|t| t.as_str().to_string()));
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<TrackedSource>> {
        let state = self.state();
        let mut rows: Vec<_> = state
            .tokens
            .iter()
            .map(|(name, token)| TrackedSource {
                name: name.clone(),
                last_modified: token.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}

// --- Fetcher ---

#[derive(Debug, Clone)]
pub struct Upstream {
    pub status: u16,
    pub payload: Vec<u8>,
    pub last_modified: Option<String>,
}

impl Upstream {
    pub fn ok(payload: Vec<u8>, last_modified: Option<&str>) -> Self {
        Self {
            status: 200,
            payload,
            last_modified: last_modified.map(str::to_string),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            payload: Vec::new(),
            last_modified: None,
        }
    }
}

/// Serves canned upstream state per URL and answers conditional requests
/// the way an HTTP server comparing `If-Modified-Since` would.
#[derive(Default)]
pub struct ScriptedFetcher {
    upstream: Mutex<HashMap<String, Upstream>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedFetcher {
    pub fn serve(&self, url: &str, upstream: Upstream) {
        self.upstream.lock().unwrap().insert(url.to_string(), upstream);
    }

    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchOutcome> {
        self.requests.lock().unwrap().push((
            request.url.to_string(),
            request.validator.map(|t| t.as_str().to_string()),
        ));
        let upstream = self
            .upstream
            .lock()
            .unwrap()
            .get(request.url)
            .cloned()
            .ok_or_else(|| StorageError::Fetch(format!("no route to {}", request.url)))?;
        if !(200..300).contains(&upstream.status) {
            return Err(StorageError::Status(upstream.status));
        }
        if let (Some(validator), Some(current)) = (request.validator, &upstream.last_modified) {
            if validator.as_str() == current {
                return Ok(FetchOutcome::NotModified);
            }
        }
        Ok(FetchOutcome::Modified {
            payload: upstream.payload,
            token: upstream.last_modified.map(ChangeToken::new),
        })
    }
}

// --- Converter ---

/// Copies the input file's bytes into the fake staging table.
pub struct FakeConverter {
    warehouse: Arc<FakeWarehouse>,
    failure: Mutex<Option<String>>,
    jobs: Mutex<Vec<ConvertJob>>,
}

impl FakeConverter {
    pub fn new(warehouse: Arc<FakeWarehouse>) -> Self {
        Self {
            warehouse,
            failure: Mutex::new(None),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_with(&self, stderr: &str) {
        *self.failure.lock().unwrap() = Some(stderr.to_string());
    }

    pub fn jobs(&self) -> Vec<ConvertJob> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Converter for FakeConverter {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn convert(&self, job: &ConvertJob) -> Result<ConversionReport> {
        self.jobs.lock().unwrap().push(job.clone());
        if let Some(stderr) = self.failure.lock().unwrap().clone() {
            return Ok(ConversionReport {
                exit_code: Some(1),
                success: false,
                timed_out: false,
                stdout: String::new(),
                stderr,
            });
        }
        let content = std::fs::read(&job.input)?;
        self.warehouse
            .load_staging(job.destination.table.as_str(), content)?;
        Ok(ConversionReport::succeeded())
    }
}

// --- Fixtures ---

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A shapefile bundle plus a file the source does not ask for.
pub fn roads_zip(shp: &[u8]) -> Vec<u8> {
    zip_bytes(&[
        ("roads.shp", shp),
        ("roads.shx", b"shx"),
        ("roads.dbf", b"dbf"),
        ("roads.prj", b"prj"),
        ("LICENSE.txt", b"license"),
    ])
}

pub fn zipped_source(name: &str, url: &str) -> SourceSpec {
    SourceSpec {
        name: Identifier::parse(name).unwrap(),
        url: url.to_string(),
        file: PathBuf::from(format!("{name}.shp")),
        archive: Some(ArchiveSpec {
            format: ArchiveFormat::Zip,
            files: ["shp", "shx", "dbf", "prj"]
                .iter()
                .map(|ext| format!("{name}.{ext}"))
                .collect(),
        }),
        ogropts: Vec::new(),
    }
}

pub fn raw_source(name: &str, url: &str, file: &str) -> SourceSpec {
    SourceSpec {
        name: Identifier::parse(name).unwrap(),
        url: url.to_string(),
        file: PathBuf::from(file),
        archive: None,
        ogropts: Vec::new(),
    }
}

pub struct TestContext {
    pub temp_dir: TempDir,
    pub settings: Settings,
    pub warehouse: Arc<FakeWarehouse>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub converter: Arc<FakeConverter>,
    pub journal: Arc<Journal>,
    pub synchronizer: Synchronizer,
}

impl TestContext {
    pub fn workdir(&self, name: &str) -> PathBuf {
        self.settings.data_dir.join(name)
    }
}

pub fn init_test_context() -> anyhow::Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let mut settings = Settings::new(temp_dir.path().join("data"));
    settings.temp_schema = Identifier::parse("stage")?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let warehouse = Arc::new(FakeWarehouse::default());
    let fetcher = Arc::new(ScriptedFetcher::default());
    let converter = Arc::new(FakeConverter::new(Arc::clone(&warehouse)));

    let journal = Arc::new(Journal::open(&Journal::path_in(&settings.data_dir))?);
    journal.initialize_schema()?;

    let synchronizer = Synchronizer::new(
        &settings,
        Arc::clone(&warehouse) as Arc<dyn Warehouse>,
        Arc::clone(&fetcher) as Arc<dyn SourceFetcher>,
        Arc::clone(&converter) as Arc<dyn Converter>,
    )
    .with_journal(Arc::clone(&journal));

    Ok(TestContext {
        temp_dir,
        settings,
        warehouse,
        fetcher,
        converter,
        journal,
        synchronizer,
    })
}
