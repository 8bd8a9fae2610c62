// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::sync::Arc;
use std::time::Instant;

use recon_lib::models::core::{ExternalRef, SourceSystem};
use recon_lib::models::mapping::{MappingFilter, MatchType};
use recon_lib::store::postgres::{
    ensure_schema, PgAuditSink, PgMappingStore, PgRecordProvider, PgRunTracker,
};
use recon_lib::utils::config::ReconConfig;
use recon_lib::utils::db_connect::{connect, get_pool_status, PgPool};
use recon_lib::utils::env::load_env;
use recon_lib::utils::progress_bars::progress_config::ProgressConfig;
use recon_lib::Reconciler;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Reconcile project records across CRM, PM and photo systems",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Match every unlinked record of every configured pair
    Run,
    /// Link two records by hand
    Link {
        source_system: SourceSystem,
        source_id: String,
        target_system: SourceSystem,
        target_id: String,
    },
    /// Clear the non-master sides of a mapping
    Unlink { mapping_id: String },
    /// Print mappings as JSON
    List {
        #[arg(long)]
        conflicts_only: bool,
        #[arg(long)]
        match_type: Option<MatchType>,
        #[arg(long)]
        linked_system: Option<SourceSystem>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Create the reconciliation tables
    InitSchema,
}

fn build_reconciler(pool: &PgPool, config: ReconConfig, progress: &ProgressConfig) -> Reconciler {
    let multi_progress = if progress.should_show_detailed() {
        progress.create_multi_progress()
    } else {
        None
    };
    let mut reconciler = Reconciler::new(config, Arc::new(PgMappingStore::new(pool.clone())))
        .with_audit_sink(Arc::new(PgAuditSink::new(pool.clone())))
        .with_run_tracker(Arc::new(PgRunTracker::new(pool.clone())))
        .with_progress(multi_progress);
    for provider in PgRecordProvider::all(pool) {
        reconciler = reconciler.with_provider(Arc::new(provider));
    }
    reconciler
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    load_env();
    let cli = Cli::parse();

    let config = ReconConfig::from_env();
    config.validate().context("Invalid reconciliation configuration")?;
    config.log_config();

    let progress = ProgressConfig::from_env();
    info!(
        "Progress tracking: enabled={}, detailed={}",
        progress.enabled, progress.detailed
    );

    let start = Instant::now();
    let pool = connect().await.context("Failed to connect to database")?;
    let (total, idle, in_use) = get_pool_status(&pool);
    info!("Pool status: {} connections ({} idle, {} in use)", total, idle, in_use);

    if let Command::InitSchema = cli.command {
        ensure_schema(&pool).await?;
        return Ok(());
    }

    let reconciler = build_reconciler(&pool, config, &progress);
    match cli.command {
        Command::Run => {
            let summary = reconciler.run_bulk_match().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Link {
            source_system,
            source_id,
            target_system,
            target_id,
        } => {
            let mapping = reconciler
                .manual_link(
                    ExternalRef::new(source_system, source_id),
                    ExternalRef::new(target_system, target_id),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&mapping)?);
        }
        Command::Unlink { mapping_id } => {
            let mapping = reconciler.unlink(&mapping_id).await?;
            println!("{}", serde_json::to_string_pretty(&mapping)?);
        }
        Command::List {
            conflicts_only,
            match_type,
            linked_system,
            limit,
            offset,
        } => {
            let filter = MappingFilter {
                match_type,
                conflicts_only,
                linked_system,
                limit: Some(limit),
                offset,
            };
            let mappings = reconciler.list_mappings(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&mappings)?);
        }
        Command::InitSchema => {}
    }

    info!("Finished in {:.2?}", start.elapsed());
    Ok(())
}
