use crate::archive;
use crate::config::{Settings, SourceSpec};
use crate::convert::{ConvertJob, Converter};
use crate::errors::{Result, StorageError};
use crate::fetch::{FetchOutcome, FetchRequest, SourceFetcher};
use crate::ident::Identifier;
use crate::journal::Journal;
use crate::models::{RunReport, SourceReport, SyncOutcome, SyncState};
use crate::staging::StagingArea;
use crate::warehouse::Warehouse;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Skip the conditional request and republish even if upstream is unchanged.
    pub force: bool,
    /// Remove the working directory after a successful publish.
    pub delete_cache: bool,
}

/// Drives each configured source through fetch, extract, convert, index and
/// publish.
///
/// Sources are processed one at a time. A failing source is logged and
/// reported; the remaining sources are still attempted.
pub struct Synchronizer {
    warehouse: Arc<dyn Warehouse>,
    fetcher: Arc<dyn SourceFetcher>,
    converter: Arc<dyn Converter>,
    staging: StagingArea,
    journal: Option<Arc<Journal>>,
}

impl Synchronizer {
    pub fn new(
        settings: &Settings,
        warehouse: Arc<dyn Warehouse>,
        fetcher: Arc<dyn SourceFetcher>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            warehouse,
            fetcher,
            converter,
            staging: StagingArea::new(settings),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Syncs every source in order. Only a failure to prepare the metadata
    /// schema aborts the run; per-source failures end up in the report.
    pub async fn run_all(&self, sources: &[SourceSpec], options: &SyncOptions) -> Result<RunReport> {
        self.warehouse.ensure_schema().await?;

        let mut report = RunReport::default();
        for source in sources {
            let attempt = self.journal_start(&source.name);
            let outcome = self.sync_source(source, options).await;
            match &outcome {
                Ok(SyncOutcome::Unchanged) => {
                    log::info!("Table {} did not require updating", source.name)
                }
                Ok(SyncOutcome::Published { token }) => log::info!(
                    "Table {} updated (last modified: {})",
                    source.name,
                    token.as_ref().map(|t| t.as_str()).unwrap_or("unknown")
                ),
                Err(_) => {}
            }
            self.journal_finish(attempt, &outcome);
            report.sources.push(SourceReport {
                name: source.name.clone(),
                outcome,
            });
        }
        Ok(report)
    }

    /// One attempt for one source, holding the source lock throughout.
    pub async fn sync_source(&self, source: &SourceSpec, options: &SyncOptions) -> Result<SyncOutcome> {
        let name = &source.name;
        if let Err(err) = self.warehouse.lock_source(name).await {
            log::error!("Source '{}' failed while {}: {}", name, SyncState::Idle, err);
            return Err(err);
        }

        let mut state = SyncState::Locked;
        let result = self.attempt(source, options, &mut state).await;

        if let Err(err) = self.warehouse.unlock_source(name).await {
            log::warn!("Could not release the lock for '{}': {}", name, err);
        }
        if let Err(err) = &result {
            log::error!("Source '{}' failed while {}: {}", name, state, err);
        }
        result
    }

    async fn attempt(
        &self,
        source: &SourceSpec,
        options: &SyncOptions,
        state: &mut SyncState,
    ) -> Result<SyncOutcome> {
        let name = &source.name;
        let previous = self.warehouse.get_token(name).await?;
        let validator = if options.force { None } else { previous.as_ref() };

        *state = SyncState::Fetching;
        log::info!(
            "Fetching '{}' from {} ({})",
            name,
            source.url,
            match validator {
                Some(token) => format!("if modified since {token}"),
                None => "unconditional".to_string(),
            }
        );
        let fetched = self
            .fetcher
            .fetch(FetchRequest {
                url: &source.url,
                validator,
            })
            .await?;
        let (payload, token) = match fetched {
            FetchOutcome::NotModified => {
                *state = SyncState::NotModified;
                return Ok(SyncOutcome::Unchanged);
            }
            FetchOutcome::Modified { payload, token } => (payload, token),
        };
        *state = SyncState::Fetched;
        log::debug!("Downloaded {} bytes for '{}'", payload.len(), name);
        if token.is_none() {
            log::warn!(
                "Upstream for '{}' sent no Last-Modified header; it will be fetched unconditionally next run",
                name
            );
        }

        *state = SyncState::WorkdirReset;
        let workdir = self.staging.reset_working_dir(name).await?;

        *state = SyncState::StagingReset;
        self.warehouse.reset_staging_table(name).await?;

        *state = SyncState::Extracting;
        let input = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || archive::materialize(&source, &payload, &workdir))
                .await
                .map_err(|err| StorageError::Other(err.into()))??
        };

        *state = SyncState::Converting;
        let job = ConvertJob::new(source, input, self.staging.staging_table(name));
        let report = self.converter.convert(&job).await?.into_result()?;
        if !report.stderr.trim().is_empty() {
            log::debug!("{} output for '{}':\n{}", self.converter.name(), name, report.stderr.trim_end());
        }

        *state = SyncState::Indexing;
        self.warehouse.index_staging_table(name).await?;

        *state = SyncState::Publishing;
        self.warehouse.publish(name, token.as_ref()).await?;

        *state = SyncState::Done;
        if options.delete_cache {
            self.staging.remove_working_dir(name).await;
        }
        Ok(SyncOutcome::Published { token })
    }

    fn journal_start(&self, name: &Identifier) -> Option<i64> {
        let journal = self.journal.as_ref()?;
        match journal.start_attempt(name.as_str()) {
            Ok(id) => Some(id),
            Err(err) => {
                log::warn!("Could not record attempt for '{}': {}", name, err);
                None
            }
        }
    }

    fn journal_finish(&self, attempt: Option<i64>, outcome: &Result<SyncOutcome>) {
        let (Some(journal), Some(attempt)) = (self.journal.as_ref(), attempt) else {
            return;
        };
        let (status, details) = match outcome {
            Ok(SyncOutcome::Unchanged) => ("UNCHANGED", String::new()),
            Ok(SyncOutcome::Published { token }) => (
                "PUBLISHED",
                token.as_ref().map(|t| t.to_string()).unwrap_or_default(),
            ),
            Err(err) => ("FAILED", err.to_string()),
        };
        if let Err(err) = journal.finish_attempt(attempt, status, &details) {
            log::warn!("Could not record attempt outcome: {}", err);
        }
    }
}
