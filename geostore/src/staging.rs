//! Scratch space for one sync attempt: a working directory on disk and a
//! table in the staging schema, both named after the source.
//!
//! Both are reset before use rather than cleaned up afterwards. Whatever an
//! aborted attempt left behind is removed by the next attempt.

use crate::config::Settings;
use crate::errors::Result;
use crate::ident::{Identifier, QualifiedTable};
use sqlx::PgPool;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct StagingArea {
    data_dir: PathBuf,
    temp_schema: Identifier,
}

impl StagingArea {
    pub fn new(settings: &Settings) -> Self {
        Self {
            data_dir: settings.data_dir.clone(),
            temp_schema: settings.temp_schema.clone(),
        }
    }

    pub fn working_dir(&self, name: &Identifier) -> PathBuf {
        self.data_dir.join(name.as_str())
    }

    pub fn staging_table(&self, name: &Identifier) -> QualifiedTable {
        QualifiedTable::for_source(&self.temp_schema, name)
    }

    /// Empties `<data_dir>/<name>`, creating it if needed.
    pub async fn reset_working_dir(&self, name: &Identifier) -> Result<PathBuf> {
        let dir = self.working_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => log::debug!("Removed previous working directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Best-effort removal after a successful publish.
    pub async fn remove_working_dir(&self, name: &Identifier) {
        let dir = self.working_dir(name);
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            if err.kind() != ErrorKind::NotFound {
                log::warn!("Could not remove {}: {}", dir.display(), err);
            }
        }
    }

    pub async fn reset_staging_table(&self, pool: &PgPool, name: &Identifier) -> Result<()> {
        let table = self.staging_table(name);
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(pool)
            .await?;
        Ok(())
    }
}
