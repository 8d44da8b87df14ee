use crate::errors::StorageError;
use crate::ident::Identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque marker of upstream state, stored verbatim (an HTTP `Last-Modified` value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(String);

impl ChangeToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of one source through a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Locked,
    Fetching,
    Fetched,
    WorkdirReset,
    StagingReset,
    Extracting,
    Converting,
    Indexing,
    Publishing,
    Done,
    NotModified,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncState::Idle => "idle",
            SyncState::Locked => "locked",
            SyncState::Fetching => "fetching",
            SyncState::Fetched => "fetched",
            SyncState::WorkdirReset => "resetting working directory",
            SyncState::StagingReset => "resetting staging table",
            SyncState::Extracting => "extracting",
            SyncState::Converting => "converting",
            SyncState::Indexing => "indexing",
            SyncState::Publishing => "publishing",
            SyncState::Done => "done",
            SyncState::NotModified => "not modified",
        };
        f.write_str(label)
    }
}

/// Successful end states of a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Upstream confirmed nothing changed; nothing was written.
    Unchanged,
    /// A new table was published together with this token.
    Published { token: Option<ChangeToken> },
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::Published { .. } => "published",
        }
    }
}

/// Per-source result of a run.
#[derive(Debug)]
pub struct SourceReport {
    pub name: Identifier,
    pub outcome: std::result::Result<SyncOutcome, StorageError>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.sources.iter().any(|s| s.outcome.is_err())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Identifier, &StorageError)> {
        self.sources
            .iter()
            .filter_map(|s| s.outcome.as_ref().err().map(|err| (&s.name, err)))
    }

    pub fn outcome_of(&self, name: &str) -> Option<&std::result::Result<SyncOutcome, StorageError>> {
        self.sources
            .iter()
            .find(|s| s.name.as_str() == name)
            .map(|s| &s.outcome)
    }
}

// --- Metadata table and journal rows ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedSource {
    pub name: String,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt_id: i64,
    pub run_id: String,
    pub source: String,
    pub start_time: i64, // Unix timestamp
    pub end_time: Option<i64>,
    pub status: String,
    pub details: String,
}
