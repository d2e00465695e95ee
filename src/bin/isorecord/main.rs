//! isorecord CLI tool
//!
//! Command-line interface for composing ISO 19115-3 records and publishing them to GeoNetwork.
//!
//! ## Commands
//!
//! - `parse <yaml>`: build every record, write `<identifier>.xml` files and `records.csv`
//! - `upload <csv>`: register the XML files listed in the table and record their UUIDs
//! - `update-postponed <csv>`: resolve the pending references of the table and patch records
//! - `update <csv> <locator> <payload>`: apply one batch edit to every record of the table
//! - `delete <csv>`: delete every record of the table from the catalog
//! - `run <yaml>`: parse, upload and update-postponed in one go
//!
//! Catalog settings come from `isorecord.toml` (or `--config`), `.env.shared`, `.env.secret`
//! and the environment (`GEONETWORK`, `API_PATH`, `GEONETWORK_USER`, `GEONETWORK_PASSWORD`).

use clap::{Parser, Subcommand};
use isorecord::{
    audit::AuditTable,
    batch::{BatchOrchestrator, BatchReport, FailurePolicy},
    catalog::{Catalog, GeoNetworkClient, MemoryCatalog},
    config::Config,
    resolver::EditDirective,
    tree::load_path,
};
use std::path::{Path, PathBuf};

/// Name of the audit table written next to the XML files.
const AUDIT_FILE: &str = "records.csv";

#[derive(Parser)]
#[command(name = "isorecord")]
#[command(author, version, about = "Compose ISO 19115-3 records and publish them to GeoNetwork", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the records described by a YAML file
    Parse {
        /// Multi-document YAML file (or a directory of them), one document per record
        yaml: PathBuf,

        /// Where XML files and the audit table are written
        #[arg(short, long)]
        output_folder: Option<PathBuf>,
    },

    /// Register the XML files listed in an audit table
    Upload {
        csv: PathBuf,

        /// Keep going when a record fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Patch the references left pending by `upload`
    UpdatePostponed {
        csv: PathBuf,

        #[arg(long)]
        continue_on_error: bool,
    },

    /// Apply one edit to every record of an audit table
    Update {
        csv: PathBuf,

        /// Locator of the edited element, relative to the record root
        locator: String,

        /// XML fragment or text value
        payload: String,

        #[arg(short, long, default_value = "add")]
        mode: EditDirective,

        #[arg(long)]
        continue_on_error: bool,
    },

    /// Delete every record of an audit table
    Delete { csv: PathBuf },

    /// Build, register and patch in one batch
    Run {
        yaml: PathBuf,

        #[arg(short, long)]
        output_folder: Option<PathBuf>,

        #[arg(long)]
        continue_on_error: bool,

        /// Use an in-memory catalog instead of GeoNetwork
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(execute(cli.command, config))
}

fn policy(config: &Config, continue_on_error: bool) -> FailurePolicy {
    if continue_on_error {
        FailurePolicy::Continue
    } else {
        config.batch.policy
    }
}

fn output_folder(config: &Config, requested: Option<PathBuf>) -> PathBuf {
    requested
        .or_else(|| config.batch.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("records"))
}

fn geonetwork(config: &Config) -> Result<GeoNetworkClient, Box<dyn std::error::Error>> {
    Ok(GeoNetworkClient::new(config.require_catalog()?)?)
}

/// Print failures, persist the table and turn an unsuccessful report into an error.
fn finish(report: BatchReport, csv: &Path) -> Result<(), Box<dyn std::error::Error>> {
    for (local_id, status) in report.failures() {
        eprintln!("{local_id}: {status:?}");
    }
    println!("{}", report.summary());
    let success = report.is_success();
    report.into_audit().write_csv(csv)?;
    println!("Audit table written to {}", csv.display());
    if success {
        Ok(())
    } else {
        Err("batch finished with failures".into())
    }
}

async fn run_batch<C: Catalog>(
    catalog: C,
    config: &Config,
    yaml: &Path,
    folder: PathBuf,
    continue_on_error: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let trees = load_path(yaml)?;
    let report = BatchOrchestrator::new(catalog)
        .with_policy(policy(config, continue_on_error))
        .with_output_dir(&folder)
        .run(&trees)
        .await;
    finish(report, &folder.join(AUDIT_FILE))
}

async fn execute(command: Commands, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Parse {
            yaml,
            output_folder: requested,
        } => {
            let folder = output_folder(&config, requested);
            let trees = load_path(&yaml)?;
            let (built, report) = BatchOrchestrator::new(MemoryCatalog::new())
                .with_policy(config.batch.policy)
                .with_output_dir(&folder)
                .build_all(&trees);
            println!("Wrote {} record(s) to {}", built.len(), folder.display());
            finish(report, &folder.join(AUDIT_FILE))
        }

        Commands::Upload {
            csv,
            continue_on_error,
        } => {
            let table = AuditTable::read_csv(&csv)?;
            let report = BatchOrchestrator::new(geonetwork(&config)?)
                .with_policy(policy(&config, continue_on_error))
                .register_table(table)
                .await;
            finish(report, &csv)
        }

        Commands::UpdatePostponed {
            csv,
            continue_on_error,
        } => {
            let table = AuditTable::read_csv(&csv)?;
            let report = BatchOrchestrator::new(geonetwork(&config)?)
                .with_policy(policy(&config, continue_on_error))
                .resume(table)
                .await;
            finish(report, &csv)
        }

        Commands::Update {
            csv,
            locator,
            payload,
            mode,
            continue_on_error,
        } => {
            let table = AuditTable::read_csv(&csv)?;
            let report = BatchOrchestrator::new(geonetwork(&config)?)
                .with_policy(policy(&config, continue_on_error))
                .edit_all(&table, &locator, &payload, mode)
                .await;
            finish(report, &csv)
        }

        Commands::Delete { csv } => {
            let mut table = AuditTable::read_csv(&csv)?;
            let deleted = BatchOrchestrator::new(geonetwork(&config)?)
                .delete_all(&table)
                .await?;
            for row in table.rows_mut() {
                row.final_id = None;
            }
            table.write_csv(&csv)?;
            println!("Deleted {} record(s)", deleted.len());
            Ok(())
        }

        Commands::Run {
            yaml,
            output_folder: requested,
            continue_on_error,
            dry_run,
        } => {
            let folder = output_folder(&config, requested);
            if dry_run {
                run_batch(MemoryCatalog::new(), &config, &yaml, folder, continue_on_error).await
            } else {
                run_batch(geonetwork(&config)?, &config, &yaml, folder, continue_on_error).await
            }
        }
    }
}
