//! # Retail Sync CLI
//!
//! Runs the incremental transfer, the geo enrichment, or both.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin retail_sync -- transfer
//! cargo run --bin retail_sync -- enrich --limit 500 --max-requests 1000
//! cargo run --bin retail_sync -- refresh-sales
//! cargo run --bin retail_sync -- --config prod.toml run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use retail_sync::{
    connection_manager::{DbRole, WorkerId},
    credential_pool::CredentialPool,
    database::{self, PgConnectionManager, PgEnrichmentStore, PgSink, PgSource},
    enrichment::{EnrichmentConfig, EnrichmentStats, GeoEnrichmentEngine},
    geocoder::HttpGeocoder,
    transfer::{TransferConfig, TransferEngine, TransferStats},
    Settings, SyncError,
};
use std::sync::Arc;

const TRANSFER_WORKER: WorkerId = WorkerId(1);
const ENRICHMENT_WORKER: WorkerId = WorkerId(2);

#[derive(Parser, Debug)]
#[command(name = "retail_sync", version, about = "Incremental sales replication and store enrichment")]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Serve Prometheus metrics on this address
    #[cfg(feature = "observability")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy new source rows into the sink
    Transfer,
    /// Geocode stores that have no characteristics record yet
    Enrich(EnrichArgs),
    /// Recompute sales of store records still at zero
    RefreshSales,
    /// Transfer, then enrich
    Run(EnrichArgs),
}

#[derive(Parser, Debug, Clone)]
struct EnrichArgs {
    /// Maximum number of (chain, address, date) tuples to process
    #[arg(long)]
    limit: Option<usize>,

    /// Geocoding request budget for this run
    #[arg(long)]
    max_requests: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let settings = Settings::from_path(&args.config)
        .with_context(|| format!("Cannot load settings from {}", args.config))?;

    install_metrics(&args)?;

    println!("🚀 Retail Sync");
    println!("   source: {} ({})", database::mask_url(&settings.source.url), settings.source.table);
    println!("   sink:   {} ({})", database::mask_url(&settings.sink.url), settings.sink.table);

    let manager = database::connection_manager(&settings);

    match args.cmd {
        Command::Transfer => {
            if let Some(stats) = run_transfer(&settings, &manager).await? {
                print_transfer(&settings, &stats);
            }
        }
        Command::Enrich(enrich) => {
            if let Some(stats) = run_enrichment(&settings, &manager, &enrich).await? {
                print_enrichment(&stats);
            }
        }
        Command::RefreshSales => {
            let engine = enrichment_engine(&settings, &manager, &EnrichArgs { limit: None, max_requests: None })?;
            let result = engine.refresh_sales().await;
            release_worker(&manager, ENRICHMENT_WORKER).await;
            if let Some(updated) = settle("Sales refresh", result)? {
                println!("{} Refreshed sales for {} store records", "✓".green(), updated);
            }
        }
        Command::Run(enrich) => {
            if let Some(stats) = run_transfer(&settings, &manager).await? {
                print_transfer(&settings, &stats);
            }
            if let Some(stats) = run_enrichment(&settings, &manager, &enrich).await? {
                print_enrichment(&stats);
            }
        }
    }

    Ok(())
}

#[cfg(feature = "observability")]
fn install_metrics(args: &Args) -> Result<()> {
    if let Some(addr) = args.metrics_addr {
        retail_sync::metrics::install_prometheus_exporter(addr)?;
        println!("✅ Metrics exporter listening on {}", addr);
    }
    Ok(())
}

#[cfg(not(feature = "observability"))]
fn install_metrics(_args: &Args) -> Result<()> {
    Ok(())
}

/// Fatal errors end the process; other run errors are reported and the command completes.
fn settle<T>(stage: &str, result: Result<T, SyncError>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e).with_context(|| format!("{} failed", stage)),
        Err(e) => {
            println!("{} {} stopped: {}", "✗".red(), stage, e);
            Ok(None)
        }
    }
}

async fn run_transfer(settings: &Settings, manager: &Arc<PgConnectionManager>) -> Result<Option<TransferStats>> {
    let source = Arc::new(PgSource::new(
        manager.clone(),
        TRANSFER_WORKER,
        &settings.source.table,
        &settings.source.key_column,
    ));
    let sink = Arc::new(PgSink::new(manager.clone(), TRANSFER_WORKER, &settings.sink.table));
    let engine = TransferEngine::new(source, sink, TransferConfig::from_settings(settings));
    let result = engine.run().await;
    release_worker(manager, TRANSFER_WORKER).await;
    settle("Transfer", result)
}

fn enrichment_engine(
    settings: &Settings,
    manager: &Arc<PgConnectionManager>,
    args: &EnrichArgs,
) -> Result<GeoEnrichmentEngine<PgEnrichmentStore, HttpGeocoder>> {
    let store = Arc::new(PgEnrichmentStore::new(
        manager.clone(),
        ENRICHMENT_WORKER,
        &settings.enrichment.table,
        &settings.source.table,
        settings.enrichment.area_column.clone(),
    ));
    let geocoder = Arc::new(HttpGeocoder::new(&settings.geocoder).context("Cannot build geocoder HTTP client")?);
    let pool = CredentialPool::from_keys(settings.geocoder.api_keys.iter().cloned());

    let mut config = EnrichmentConfig::from_settings(settings);
    if let Some(limit) = args.limit {
        config.selection_limit = limit;
    }
    if args.max_requests.is_some() {
        config.max_requests = args.max_requests;
    }
    Ok(GeoEnrichmentEngine::new(store, geocoder, pool, config))
}

async fn run_enrichment(
    settings: &Settings,
    manager: &Arc<PgConnectionManager>,
    args: &EnrichArgs,
) -> Result<Option<EnrichmentStats>> {
    let mut engine = enrichment_engine(settings, manager, args)?;
    let result = engine.enrich().await;
    release_worker(manager, ENRICHMENT_WORKER).await;
    settle("Enrichment", result)
}

async fn release_worker(manager: &PgConnectionManager, worker: WorkerId) {
    manager.release(worker, DbRole::Source).await;
    manager.release(worker, DbRole::Sink).await;
}

fn print_transfer(settings: &Settings, stats: &TransferStats) {
    println!();
    println!("{}", format!("Transfer into {}", settings.sink.table).bold());
    println!("  Checkpoint:   {} -> {}", stats.checkpoint, stats.last_key);
    println!("  Batches:      {}", stats.batches);
    println!("  Fetched:      {}", stats.fetched);
    println!("  Inserted:     {}", stats.inserted.to_string().green());
    if stats.error_count() > 0 {
        println!(
            "  Errors:       {} (conversion {}, insert {})",
            stats.error_count().to_string().red(),
            stats.conversion_errors,
            stats.insert_errors
        );
    }
    if let Some(path) = &stats.error_log {
        println!("  Error log:    {}", path.display());
    }
    if let Some(count) = stats.final_row_count {
        println!("  Sink rows:    {}", count);
    }
    println!("  Elapsed:      {:.1?}", stats.elapsed);
}

fn print_enrichment(stats: &EnrichmentStats) {
    println!();
    println!("{}", "Store enrichment".bold());
    println!("  Selected:     {}", stats.fetched);
    println!("  Saved:        {} ({} geocoded, {} heuristic)", stats.saved.to_string().green(), stats.geocoded, stats.heuristic);
    println!("  Skipped:      {}", stats.skipped_existing);
    if stats.errors > 0 {
        println!("  Errors:       {}", stats.errors.to_string().red());
    }
    println!("  API requests: {}", stats.api_requests);
    for usage in &stats.credentials {
        let state = if usage.exhausted { "exhausted".red() } else { "ok".green() };
        println!(
            "    {}: {} requests, {} ok, {} quota hits [{}]",
            usage.label, usage.requests, usage.successes, usage.quota_hits, state
        );
    }
    if stats.limit_hit {
        println!("{} Geocoder quota exhausted on every key, run stopped early", "⚠".yellow());
    }
    if stats.budget_reached {
        println!("{} Request budget reached, run stopped early", "⚠".yellow());
    }
    println!("  Elapsed:      {:.1?}", stats.elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use retail_sync::StoreError;

    #[test]
    fn test_settle_keeps_non_fatal_errors_out_of_exit_status() {
        let stopped = settle::<u64>("Transfer", Err(SyncError::Store(StoreError::Backend("syntax error".into()))));
        assert!(matches!(stopped, Ok(None)));

        let done = settle("Transfer", Ok(7u64));
        assert!(matches!(done, Ok(Some(7))));
    }

    #[test]
    fn test_settle_fails_on_unreachable_store() {
        let err = settle::<u64>("Enrichment", Err(SyncError::Store(StoreError::Unavailable("down".into()))))
            .unwrap_err();
        assert!(err.to_string().contains("Enrichment failed"));
    }
}
