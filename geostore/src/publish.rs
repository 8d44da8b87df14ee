//! Post-load indexing and the staging-to-published swap.

use crate::catalog::ChangeTracker;
use crate::config::Settings;
use crate::errors::Result;
use crate::ident::{Identifier, QualifiedTable};
use crate::models::ChangeToken;
use sqlx::PgPool;

/// Row-identifier column added by ogr2ogr.
pub const ROW_ID_COLUMN: &str = "ogc_fid";

#[derive(Clone)]
pub struct TablePublisher {
    pool: PgPool,
    tracker: ChangeTracker,
    schema: Identifier,
    temp_schema: Identifier,
    geometry_column: Identifier,
    renderuser: Option<Identifier>,
}

impl TablePublisher {
    pub fn new(pool: PgPool, tracker: ChangeTracker, settings: &Settings) -> Self {
        Self {
            pool,
            tracker,
            schema: settings.schema.clone(),
            temp_schema: settings.temp_schema.clone(),
            geometry_column: settings.geometry_column.clone(),
            renderuser: settings.renderuser.clone(),
        }
    }

    pub fn staging_table(&self, name: &Identifier) -> QualifiedTable {
        QualifiedTable::for_source(&self.temp_schema, name)
    }

    pub fn published_table(&self, name: &Identifier) -> QualifiedTable {
        QualifiedTable::for_source(&self.schema, name)
    }

    /// SQL run against the staging table after the converter filled it, in
    /// one transaction.
    ///
    /// Rows are clustered on a geohash of their envelope through a scratch
    /// index, which is dropped again before the durable GiST index is built.
    pub fn index_statements(&self, name: &Identifier) -> Vec<String> {
        let stage = self.staging_table(name);
        let order_index = name.folded().with_suffix("_order");
        let geom = self.geometry_column.quoted();
        vec![
            format!("ALTER TABLE {stage} DROP COLUMN \"{ROW_ID_COLUMN}\""),
            format!(
                "CREATE INDEX {} ON {stage} (ST_GeoHash(ST_Transform(ST_Envelope({geom}), 4326), 10) COLLATE \"C\")",
                order_index.quoted()
            ),
            format!("CLUSTER {stage} USING {}", order_index.quoted()),
            format!("DROP INDEX {}", QualifiedTable::new(&self.temp_schema, &order_index)),
            format!("CREATE INDEX ON {stage} USING GIST ({geom}) WITH (fillfactor = 100)"),
        ]
    }

    /// Statistics refresh, run once the index transaction has committed.
    pub fn analyze_statement(&self, name: &Identifier) -> String {
        format!("ANALYZE {}", self.staging_table(name))
    }

    /// Prepares the staging table for readers. The index changes are
    /// committed only if every statement succeeds; `ANALYZE` follows.
    pub async fn index_staging_table(&self, name: &Identifier) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in self.index_statements(name) {
            log::debug!("{statement}");
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        let analyze = self.analyze_statement(name);
        log::debug!("{analyze}");
        sqlx::query(&analyze).execute(&self.pool).await?;
        Ok(())
    }

    /// Replaces the published table with the staging table and records the
    /// token, all in one transaction.
    ///
    /// On error the transaction is rolled back when it is dropped; the
    /// previous table and token stay as they were.
    pub async fn publish(&self, name: &Identifier, token: Option<&ChangeToken>) -> Result<()> {
        let stage = self.staging_table(name);
        let published = self.published_table(name);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {published}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {stage} SET SCHEMA {}",
            self.schema.quoted()
        ))
        .execute(&mut *tx)
        .await?;
        if let Some(role) = &self.renderuser {
            sqlx::query(&format!("GRANT SELECT ON {published} TO {}", role.quoted()))
                .execute(&mut *tx)
                .await?;
        }
        self.tracker.set_token(&mut *tx, name, token).await?;
        tx.commit().await?;

        log::info!("Published {}", published.dotted());
        Ok(())
    }
}
