//! Local SQLite record of sync attempts, kept in the data directory.
//!
//! The journal is diagnostic only. The metadata table in PostgreSQL remains
//! the sole source of truth for what has been published.

use crate::errors::{Result, StorageError};
use crate::models::AttemptRecord;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const JOURNAL_FILE: &str = "sync-journal.sqlite";

pub struct Journal {
    conn: Arc<Mutex<Connection>>,
    run_id: String,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            run_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(JOURNAL_FILE)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Other(anyhow::anyhow!("journal connection poisoned")))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS sync_attempts (
                attempt_id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                source TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                status TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS sync_attempts_source ON sync_attempts (source, attempt_id);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn start_attempt(&self, source: &str) -> Result<i64> {
        let conn = self.conn()?;
        let start_time = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO sync_attempts (run_id, source, start_time, status) VALUES (?1, ?2, ?3, 'RUNNING')",
            params![self.run_id, source, start_time],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_attempt(&self, attempt_id: i64, status: &str, details: &str) -> Result<()> {
        let conn = self.conn()?;
        let end_time = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE sync_attempts SET status = ?1, details = ?2, end_time = ?3 WHERE attempt_id = ?4",
            params![status, details, end_time, attempt_id],
        )?;
        Ok(())
    }

    pub fn last_attempt(&self, source: &str) -> Result<Option<AttemptRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT attempt_id, run_id, source, start_time, end_time, status, details
                 FROM sync_attempts WHERE source = ?1 ORDER BY attempt_id DESC LIMIT 1",
                params![source],
                |row| {
                    Ok(AttemptRecord {
                        attempt_id: row.get(0)?,
                        run_id: row.get(1)?,
                        source: row.get(2)?,
                        start_time: row.get(3)?,
                        end_time: row.get(4)?,
                        status: row.get(5)?,
                        details: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
