pub mod archive;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod errors;
pub mod fetch;
pub mod ident;
pub mod journal;
pub mod models;
pub mod publish;
pub mod staging;
pub mod sync;
pub mod warehouse;

use crate::config::Settings;
use crate::errors::Result;
use crate::journal::Journal;
use crate::warehouse::PgWarehouse;
use std::sync::Arc;

/// The main entry point for the `geostore` library.
///
/// `GeoStore` bundles the long-lived pieces a sync run needs:
/// - The settings the run was started with.
/// - A PostgreSQL warehouse (`PgWarehouse`) holding the metadata table, the
///   staging schema and the published tables.
/// - A local attempt journal (`Journal`) in the data directory.
///
/// Fetching and conversion are supplied separately when building a
/// [`sync::Synchronizer`].
///
/// # Example
///
/// ```rust,no_run
/// use geostore::{GeoStore, config::Settings};
///
/// #[tokio::main]
/// async fn main() {
///     let settings = Settings::new("data");
///     let store = GeoStore::open(settings).await.unwrap();
///     let tracked = store.warehouse.tracker().list_tokens().await.unwrap();
///     println!("{} sources tracked", tracked.len());
/// }
/// ```
pub struct GeoStore {
    pub settings: Settings,
    pub warehouse: Arc<PgWarehouse>,
    pub journal: Arc<Journal>,
}

impl GeoStore {
    /// Creates the data directory, connects to PostgreSQL and opens the journal.
    ///
    /// The metadata schema is not touched here; that happens at the start of
    /// each run.
    pub async fn open(settings: Settings) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.data_dir).await?;

        let journal = Journal::open(&Journal::path_in(&settings.data_dir))?;
        journal.initialize_schema()?;

        let warehouse = PgWarehouse::connect(&settings).await?;

        Ok(Self {
            settings,
            warehouse: Arc::new(warehouse),
            journal: Arc::new(journal),
        })
    }
}
