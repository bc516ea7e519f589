use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rsr_core::SnapshotIdentity;
use rsr_engine::{Consolidator, ConsolidatorConfig, DiffEngine, EngineConfig, SchemaRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rsr-cli")]
#[command(about = "RSR command-line interface")]
struct Cli {
    /// Path to the YAML schema registry (primary keys, filter rules,
    /// report-type aliases).
    #[arg(long, global = true, default_value = "schemas.yaml")]
    schemas: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one downloaded export against its stored snapshot.
    Reconcile {
        #[arg(long)]
        report_type: String,
        #[arg(long)]
        period: String,
        #[arg(long)]
        region: String,
        /// The freshly downloaded export file.
        #[arg(long)]
        file: PathBuf,
        /// Directory holding the identity's snapshot triplet.
        #[arg(long)]
        base_dir: PathBuf,
        /// Overrides the registry's primary key (repeatable).
        #[arg(long = "primary-key")]
        primary_key: Vec<String>,
    },
    /// Rebuild the master files for a report type from every snapshot on disk.
    Consolidate {
        #[arg(long)]
        report_type: String,
        #[arg(long)]
        destination: PathBuf,
        #[arg(long)]
        snapshots_root: PathBuf,
        /// Additional directories scanned for snapshots (repeatable).
        #[arg(long = "extra-root")]
        extra_root: Vec<PathBuf>,
        /// Overrides the registry's primary key (repeatable).
        #[arg(long = "primary-key")]
        primary_key: Vec<String>,
    },
}

fn pk_override(keys: &[String]) -> Option<&[String]> {
    if keys.is_empty() {
        None
    } else {
        Some(keys)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let registry = SchemaRegistry::from_path(&cli.schemas).await?;
    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Reconcile {
            report_type,
            period,
            region,
            file,
            base_dir,
            primary_key,
        } => {
            let engine = DiffEngine::new(registry, config);
            let identity = SnapshotIdentity {
                report_type,
                period,
                region,
            };
            let outcome = engine
                .run(&identity, &file, &base_dir, pk_override(&primary_key))
                .await?;
            println!(
                "reconcile complete: run_id={} added={} removed={} current_rows={}",
                outcome.run_id, outcome.added, outcome.removed, outcome.current_rows
            );
        }
        Commands::Consolidate {
            report_type,
            destination,
            snapshots_root,
            extra_root,
            primary_key,
        } => {
            let consolidator = Consolidator::new(
                registry,
                ConsolidatorConfig {
                    snapshots_root,
                    extra_roots: extra_root,
                    source_names: Default::default(),
                },
            );
            let outcome = consolidator
                .consolidate(&report_type, &destination, pk_override(&primary_key))
                .await?;
            println!(
                "consolidate complete: type={} current_rows={} deleted_rows={}",
                outcome.report_type, outcome.current_rows, outcome.deleted_rows
            );
        }
    }

    Ok(())
}
