use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use catalog_enricher::config::{self, Config};
use catalog_enricher::db::{self, Pool};
use catalog_enricher::embedding::{EmbeddingClient, EmbeddingGenerator};
use catalog_enricher::enrichment::EnrichmentOrchestrator;
use catalog_enricher::lookup::LookupClient;
use catalog_enricher::model::{Stage, StageStatus};
use catalog_enricher::quota::{MemoryQuotaTracker, QuotaTracker, SqliteQuotaTracker};
use catalog_enricher::search::BulkSearchClient;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Look up pending records and write the results
    Enrich,
    /// Embed enriched records and push them to the search index
    Embed,
    /// Enrichment pass followed by an embedding pass
    Run,
    /// Print record counts per stage and status
    Status,
    /// Delete batch records whose stages are both completed
    Purge,
    /// Queue a book for enrichment
    Register {
        #[arg(long)]
        isbn: Option<String>,
        #[arg(long)]
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Enrich => enrich(&cfg, &pool).await?,
        Command::Embed => embed(&cfg, &pool).await?,
        Command::Run => {
            enrich(&cfg, &pool).await?;
            embed(&cfg, &pool).await?;
        }
        Command::Status => {
            let summary = db::stage_summary(&pool).await?;
            for stage in [Stage::Enrichment, Stage::Embedding] {
                let counts: Vec<String> = [
                    StageStatus::Pending,
                    StageStatus::InProgress,
                    StageStatus::Completed,
                    StageStatus::Failed,
                ]
                .iter()
                .map(|status| format!("{}={}", status.as_str(), summary.count(stage, *status)))
                .collect();
                println!("{:<10} {}", stage.as_str(), counts.join(" "));
            }
        }
        Command::Purge => {
            let removed = db::purge_completed(&pool).await?;
            info!(removed, "purged completed batch records");
        }
        Command::Register { isbn, title } => {
            let (book_id, batch_id) = db::register_book(&pool, isbn.as_deref(), &title).await?;
            info!(book_id, batch_id, "book registered");
        }
    }

    Ok(())
}

async fn enrich(cfg: &Config, pool: &Pool) -> Result<()> {
    let quota: Arc<dyn QuotaTracker> = if cfg.pipeline.persistent_quota {
        Arc::new(SqliteQuotaTracker::new(pool.clone(), cfg.lookup.daily_quota))
    } else {
        Arc::new(MemoryQuotaTracker::new(cfg.lookup.daily_quota))
    };
    let lookup = LookupClient::new(
        &cfg.lookup.base_url,
        Duration::from_secs(cfg.lookup.request_timeout_secs),
    )?;
    let orchestrator =
        EnrichmentOrchestrator::new(pool.clone(), Arc::new(lookup), quota, cfg.pipeline_settings());
    let report = orchestrator.run().await?;
    info!(
        run_id = %report.run_id,
        claimed = report.claimed,
        completed = report.outcome.completed,
        retried = report.outcome.retried,
        failed = report.outcome.failed,
        released = report.released,
        failed_chunks = report.failed_chunks,
        quota_exhausted = report.quota_exhausted,
        "enrichment pass done"
    );
    Ok(())
}

async fn embed(cfg: &Config, pool: &Pool) -> Result<()> {
    let embedder = EmbeddingClient::new(
        &cfg.embedding.base_url,
        &cfg.embedding.api_key,
        &cfg.embedding.model,
        cfg.embedding.dimensions,
        Duration::from_secs(cfg.embedding.request_timeout_secs),
    )?;
    let indexer = BulkSearchClient::new(
        &cfg.search.base_url,
        &cfg.search.index,
        Duration::from_secs(cfg.search.request_timeout_secs),
    )?;
    let generator = EmbeddingGenerator::new(
        pool.clone(),
        Arc::new(embedder),
        Arc::new(indexer),
        &cfg.pipeline_settings(),
    );
    let report = generator.run().await?;
    info!(
        run_id = %report.run_id,
        claimed = report.claimed,
        indexed = report.indexed,
        retried = report.outcome.retried,
        failed = report.outcome.failed,
        "embedding pass done"
    );
    Ok(())
}
