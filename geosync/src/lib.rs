use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use geofetcher::HttpFetcher;
use geostore::{
    config::{RejectedSource, SettingsOverrides, SyncConfig},
    convert::Ogr2OgrConverter,
    ident::Identifier,
    models::{AttemptRecord, RunReport, SyncOutcome},
    sync::{SyncOptions, Synchronizer},
    warehouse::Warehouse,
    GeoStore,
};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs the command line interface for geosync.
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level());

    let config = SyncConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let config = SyncConfig {
        settings: config.settings.with_overrides(&cli.connection.overrides()),
        ..config
    };

    match cli.command {
        Some(Command::Status(args)) => run_status(config, args).await,
        None => run_sync(config, cli.sync_options()).await,
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Load external data into a database")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Download new data, even if not required
    #[arg(short = 'f', long, default_value_t = false)]
    force: bool,

    /// Remove each source's working directory after it is published
    #[arg(long, default_value_t = false)]
    delete_cache: bool,

    /// Configuration file
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "GEOSYNC_CONFIG",
        default_value = "external-data.yml"
    )]
    config: PathBuf,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Log debug output
    #[arg(short = 'v', long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short = 'q', long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Shows the recorded change token and last attempt of each source
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Print JSON instead of a table
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// Override database name to connect to
    #[arg(short = 'd', long, global = true)]
    database: Option<String>,

    /// Override database server host or socket directory
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Override database server port
    #[arg(short = 'p', long, global = true)]
    port: Option<u16>,

    /// Override database user name
    #[arg(short = 'U', long, global = true)]
    username: Option<String>,

    /// Override data directory
    #[arg(long = "data", global = true)]
    data_dir: Option<PathBuf>,

    /// Role granted SELECT on every published table
    #[arg(short = 'R', long, global = true)]
    renderuser: Option<Identifier>,
}

impl ConnectionArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            data_dir: self.data_dir.clone(),
            database: self.database.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            renderuser: self.renderuser.clone(),
        }
    }
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug,sqlx=warn"
        } else if self.quiet {
            "warn"
        } else {
            "info,sqlx=warn"
        }
    }

    fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            force: self.force,
            delete_cache: self.delete_cache,
        }
    }
}

fn init_tracing(default_level: &str) {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_sync(config: SyncConfig, options: SyncOptions) -> anyhow::Result<()> {
    if config.sources.is_empty() {
        if config.rejected.is_empty() {
            warn!("No sources configured; nothing to do");
        }
        return summarize(&RunReport::default(), &config.rejected);
    }

    let store = GeoStore::open(config.settings)
        .await
        .context("failed to open the database")?;
    let fetcher =
        HttpFetcher::from_settings(&store.settings).context("failed to build the HTTP client")?;
    let converter = Ogr2OgrConverter::new(&store.settings);
    let synchronizer = Synchronizer::new(
        &store.settings,
        Arc::clone(&store.warehouse) as Arc<dyn Warehouse>,
        Arc::new(fetcher),
        Arc::new(converter),
    )
    .with_journal(Arc::clone(&store.journal));

    info!(
        "Syncing {} source(s) (run {})",
        config.sources.len(),
        store.journal.run_id()
    );
    // Dropping the run on interrupt rolls back any open transaction, kills the
    // converter and closes the lock connections.
    let report = tokio::select! {
        report = synchronizer.run_all(&config.sources, &options) => {
            report.context("failed to prepare the metadata schema")?
        }
        _ = signal::ctrl_c() => {
            return Err(anyhow!("interrupted"));
        }
    };

    summarize(&report, &config.rejected)
}

fn summarize(report: &RunReport, rejected: &[RejectedSource]) -> anyhow::Result<()> {
    let mut updated = 0;
    let mut unchanged = 0;
    for source in &report.sources {
        match &source.outcome {
            Ok(SyncOutcome::Published { .. }) => updated += 1,
            Ok(SyncOutcome::Unchanged) => unchanged += 1,
            Err(err) => error!("{}: {}", source.name, err),
        }
    }

    let failed: Vec<&str> = rejected
        .iter()
        .map(|source| source.key.as_str())
        .chain(report.failures().map(|(name, _)| name.as_str()))
        .collect();
    info!(
        "{} updated, {} unchanged, {} failed",
        updated,
        unchanged,
        failed.len()
    );
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("sources failed: {}", failed.join(", ")))
    }
}

#[derive(Debug, Serialize)]
struct StatusRow {
    name: String,
    configured: bool,
    last_modified: Option<String>,
    last_attempt: Option<AttemptRecord>,
}

async fn run_status(config: SyncConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = GeoStore::open(config.settings)
        .await
        .context("failed to open the database")?;
    let tracked = store
        .warehouse
        .list_tokens()
        .await
        .context("failed to read the metadata table; has a sync run yet?")?;

    let mut rows: Vec<StatusRow> = config
        .sources
        .iter()
        .map(|source| StatusRow {
            name: source.name.to_string(),
            configured: true,
            last_modified: None,
            last_attempt: None,
        })
        .collect();
    for entry in tracked {
        match rows.iter_mut().find(|row| row.name == entry.name) {
            Some(row) => row.last_modified = entry.last_modified,
            None => rows.push(StatusRow {
                name: entry.name,
                configured: false,
                last_modified: entry.last_modified,
                last_attempt: None,
            }),
        }
    }
    for row in &mut rows {
        row.last_attempt = store.journal.last_attempt(&row.name)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let width = rows.iter().map(|row| row.name.len()).max().unwrap_or(4).max(4);
    println!("{:<width$}  {:<31}  {}", "NAME", "LAST MODIFIED", "LAST ATTEMPT");
    for row in &rows {
        let attempt = match &row.last_attempt {
            Some(record) if record.details.is_empty() => record.status.clone(),
            Some(record) => format!("{} ({})", record.status, first_line(&record.details)),
            None => "-".to_string(),
        };
        let name = if row.configured {
            row.name.clone()
        } else {
            format!("{}*", row.name)
        };
        println!(
            "{:<width$}  {:<31}  {}",
            name,
            row.last_modified.as_deref().unwrap_or("-"),
            attempt
        );
    }
    if rows.iter().any(|row| !row.configured) {
        println!("* tracked in the database but no longer configured");
    }
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
