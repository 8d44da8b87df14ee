//! Per-source change tokens, kept in the metadata table next to the published data.

use crate::config::Settings;
use crate::errors::Result;
use crate::ident::{Identifier, QualifiedTable};
use crate::models::{ChangeToken, TrackedSource};
use sqlx::{PgConnection, PgPool};

#[derive(Clone)]
pub struct ChangeTracker {
    pool: PgPool,
    schema: Identifier,
    temp_schema: Identifier,
    table: QualifiedTable,
}

impl ChangeTracker {
    pub fn new(pool: PgPool, settings: &Settings) -> Self {
        Self {
            pool,
            schema: settings.schema.clone(),
            temp_schema: settings.temp_schema.clone(),
            table: QualifiedTable::new(&settings.schema, &settings.metadata_table),
        }
    }

    pub fn table(&self) -> &QualifiedTable {
        &self.table
    }

    /// Creates the schemas and the metadata table when missing.
    ///
    /// Existing schemas are left alone, so a role without CREATE on the
    /// database can still run against a prepared `public` schema.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for schema in [&self.schema, &self.temp_schema] {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
            )
            .bind(schema.as_str())
            .fetch_one(&mut *tx)
            .await?;
            if !exists {
                log::info!("Creating schema {}", schema);
                sqlx::query(&format!("CREATE SCHEMA {}", schema.quoted()))
                    .execute(&mut *tx)
                    .await?;
            }
        }
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (name text PRIMARY KEY, last_modified text)",
            self.table
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_token(&self, name: &Identifier) -> Result<Option<ChangeToken>> {
        let row: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT last_modified FROM {} WHERE name = $1",
            self.table
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.flatten().map(ChangeToken::new))
    }

    /// Upserts the token on the caller's connection, normally the publish transaction.
    pub async fn set_token(
        &self,
        conn: &mut PgConnection,
        name: &Identifier,
        token: Option<&ChangeToken>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (name, last_modified) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET last_modified = EXCLUDED.last_modified",
            self.table
        ))
        .bind(name.as_str())
        .bind(token.map(ChangeToken::as_str))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn list_tokens(&self) -> Result<Vec<TrackedSource>> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&format!(
            "SELECT name, last_modified FROM {} ORDER BY name",
            self.table
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, last_modified)| TrackedSource {
                name,
                last_modified,
            })
            .collect())
    }
}
