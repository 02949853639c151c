//! Enrichment orchestrator: claim pending records, split them into id-range
//! partitions bound to one API key each, look every record up, then persist
//! the collected results in chunked bulk writes.

use anyhow::{bail, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CategoryCache, PublisherCache};
use crate::db::{self, Pool, WriteOutcome};
use crate::extract::map_item;
use crate::lookup::model::LookupItem;
use crate::lookup::{LookupError, LookupService};
use crate::model::{
    BookFields, EnrichmentResult, EnrichmentTarget, FailureKind, RetryPolicy, Stage,
};
use crate::quota::{mask_key, QuotaTracker};

pub const MISSING_IDENTIFIER: &str = "missing identifier";

/// In-process retry behaviour for one lookup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupPolicy {
    pub transport_max_retries: u32,
    pub transport_retry_delay: Duration,
    pub rate_limit_max_retries: u32,
    pub rate_limit_cooldown: Duration,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        Self {
            transport_max_retries: 1,
            transport_retry_delay: Duration::from_millis(500),
            rate_limit_max_retries: 2,
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Plain values the pipeline runs with, however they were loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub api_keys: Vec<String>,
    pub partition_count: usize,
    pub batch_size: i64,
    pub chunk_size: usize,
    pub enrichment_retry_cap: i64,
    pub embedding_retry_cap: i64,
    pub embedding_concurrency: usize,
    /// Age after which an IN_PROGRESS claim is considered abandoned.
    pub claim_lease: Duration,
    pub lookup: LookupPolicy,
}

/// Half-open id range `[start, end)` handled by one API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub start: i64,
    pub end: i64,
}

impl Partition {
    pub fn contains(&self, id: i64) -> bool {
        self.start <= id && id < self.end
    }
}

/// Split `[min, max]` into at most `count` contiguous ranges of
/// `ceil(range / count)` ids; trailing ranges that would start past `max`
/// are dropped.
pub fn compute_partitions(min: i64, max: i64, count: usize) -> Vec<Partition> {
    if count == 0 || max < min {
        return Vec::new();
    }
    let range = max - min + 1;
    let n = count as i64;
    let size = (range + n - 1) / n;
    (0..n)
        .map(|i| (i, min + i * size))
        .take_while(|(_, start)| *start <= max)
        .map(|(i, start)| Partition {
            index: i as usize,
            start,
            end: (start + size).min(max + 1),
        })
        .collect()
}

/// Why a partition stopped pulling records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionExit {
    Drained,
    QuotaExhausted,
    Aborted(String),
}

#[derive(Debug)]
pub struct PartitionRun {
    pub partition: Partition,
    pub exit: PartitionExit,
    pub results: Vec<EnrichmentResult>,
    /// Claimed records the partition never got to.
    pub unprocessed: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub partition: Partition,
    pub exit: PartitionExit,
    pub processed: usize,
    pub unprocessed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub run_id: Uuid,
    pub claimed: usize,
    pub partitions: Vec<PartitionSummary>,
    pub outcome: WriteOutcome,
    pub released: usize,
    pub failed_chunks: usize,
    pub quota_exhausted: bool,
}

enum CallOutcome {
    Found(LookupItem),
    NoMatch,
    Failed { reason: String, kind: FailureKind },
    QuotaExhausted,
}

/// One lookup with the transport and rate-limit retry rules applied. Every
/// attempt, retries included, is paid for from the key's quota.
async fn lookup_with_policy(
    lookup: &dyn LookupService,
    quota: &dyn QuotaTracker,
    policy: &LookupPolicy,
    api_key: &str,
    isbn: &str,
) -> Result<CallOutcome> {
    let mut transport_retries = 0;
    let mut rate_limit_retries = 0;
    loop {
        if !quota.try_acquire(api_key).await? {
            return Ok(CallOutcome::QuotaExhausted);
        }
        match lookup.lookup(api_key, isbn).await {
            Ok(Some(item)) => return Ok(CallOutcome::Found(item)),
            Ok(None) => return Ok(CallOutcome::NoMatch),
            Err(LookupError::QuotaExceeded(message)) => {
                warn!(key = %mask_key(api_key), %message, "daily quota exceeded upstream");
                return Ok(CallOutcome::QuotaExhausted);
            }
            Err(LookupError::RateLimited(message)) => {
                if rate_limit_retries >= policy.rate_limit_max_retries {
                    warn!(key = %mask_key(api_key), %message, "rate limit persists; treating key as exhausted");
                    return Ok(CallOutcome::QuotaExhausted);
                }
                rate_limit_retries += 1;
                tokio::time::sleep(policy.rate_limit_cooldown).await;
            }
            Err(LookupError::Transport(message)) => {
                if transport_retries >= policy.transport_max_retries {
                    return Ok(CallOutcome::Failed {
                        reason: format!("transport error: {message}"),
                        kind: FailureKind::Transport,
                    });
                }
                transport_retries += 1;
                tokio::time::sleep(policy.transport_retry_delay).await;
            }
            Err(err) => {
                return Ok(CallOutcome::Failed {
                    reason: err.to_string(),
                    kind: FailureKind::Application,
                })
            }
        }
    }
}

/// Process one partition's records in ascending id order until they run out
/// or the key's quota does.
#[instrument(skip_all, fields(partition = partition.index, key = %mask_key(&api_key)))]
pub async fn run_partition(
    lookup: Arc<dyn LookupService>,
    quota: Arc<dyn QuotaTracker>,
    policy: LookupPolicy,
    partition: Partition,
    api_key: String,
    mut targets: Vec<EnrichmentTarget>,
) -> PartitionRun {
    targets.sort_by_key(|t| t.batch_id);
    let mut results = Vec::with_capacity(targets.len());
    let mut exit = PartitionExit::Drained;
    let mut stopped_at = targets.len();

    for (pos, target) in targets.iter().enumerate() {
        let Some(isbn) = target.isbn.as_deref() else {
            results.push(EnrichmentResult::Failure {
                book_id: target.book_id,
                batch_id: target.batch_id,
                reason: MISSING_IDENTIFIER.to_string(),
                kind: FailureKind::MissingInput,
                retry_count: target.retry_count,
            });
            continue;
        };

        let outcome =
            match lookup_with_policy(lookup.as_ref(), quota.as_ref(), &policy, &api_key, isbn).await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(?err, batch_id = target.batch_id, "quota tracker unavailable");
                    exit = PartitionExit::Aborted(err.to_string());
                    stopped_at = pos;
                    break;
                }
            };

        match outcome {
            CallOutcome::Found(item) => results.push(EnrichmentResult::Success {
                book_id: target.book_id,
                batch_id: target.batch_id,
                fields: Box::new(map_item(&item)),
            }),
            CallOutcome::NoMatch => results.push(EnrichmentResult::Success {
                book_id: target.book_id,
                batch_id: target.batch_id,
                fields: Box::new(BookFields::default()),
            }),
            CallOutcome::Failed { reason, kind } => {
                warn!(batch_id = target.batch_id, %reason, "lookup failed");
                results.push(EnrichmentResult::Failure {
                    book_id: target.book_id,
                    batch_id: target.batch_id,
                    reason,
                    kind,
                    retry_count: target.retry_count,
                });
            }
            CallOutcome::QuotaExhausted => {
                quota.mark_exhausted(&api_key);
                exit = PartitionExit::QuotaExhausted;
                stopped_at = pos;
                break;
            }
        }
    }

    let unprocessed: Vec<i64> = targets[stopped_at..].iter().map(|t| t.batch_id).collect();
    let quota_used = quota.used(&api_key).await.ok();
    info!(
        processed = results.len(),
        unprocessed = unprocessed.len(),
        ?quota_used,
        ?exit,
        "partition finished"
    );
    PartitionRun {
        partition,
        exit,
        results,
        unprocessed,
    }
}

pub struct EnrichmentOrchestrator {
    pool: Pool,
    lookup: Arc<dyn LookupService>,
    quota: Arc<dyn QuotaTracker>,
    settings: PipelineSettings,
}

impl EnrichmentOrchestrator {
    pub fn new(
        pool: Pool,
        lookup: Arc<dyn LookupService>,
        quota: Arc<dyn QuotaTracker>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            lookup,
            quota,
            settings,
        }
    }

    /// Partition count actually used: never more than one per key.
    pub fn effective_partition_count(&self) -> usize {
        let keys = self.settings.api_keys.len();
        let requested = self.settings.partition_count.max(1);
        if requested > keys {
            warn!(requested, keys, "more partitions than API keys; clamping");
        }
        requested.min(keys)
    }

    /// One full enrichment pass over a bounded batch.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self) -> Result<EnrichmentReport> {
        if self.settings.api_keys.is_empty() {
            bail!("no API keys configured for the lookup service");
        }
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let mut report = EnrichmentReport {
            run_id,
            ..Default::default()
        };

        self.quota.reset().await?;
        db::release_stale_claims(&self.pool, Stage::Enrichment, self.settings.claim_lease).await?;
        let policy = RetryPolicy::new(self.settings.enrichment_retry_cap);
        let targets =
            db::claim_enrichment_batch(&self.pool, self.settings.batch_size, policy.cap).await?;
        report.claimed = targets.len();
        let (Some(min), Some(max)) = (
            targets.iter().map(|t| t.batch_id).min(),
            targets.iter().map(|t| t.batch_id).max(),
        ) else {
            info!("no pending enrichment records");
            return Ok(report);
        };

        // Reference caches are built before any partition starts.
        let (mut publishers, categories) = {
            let mut conn = self.pool.acquire().await?;
            (
                PublisherCache::load(&mut conn).await?,
                CategoryCache::load(&mut conn).await?,
            )
        };

        let partitions = compute_partitions(min, max, self.effective_partition_count());
        info!(claimed = targets.len(), min, max, partitions = partitions.len(), "enrichment run started");

        let mut claimed_by_partition = Vec::with_capacity(partitions.len());
        let mut handles = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let slice: Vec<EnrichmentTarget> = targets
                .iter()
                .filter(|t| partition.contains(t.batch_id))
                .cloned()
                .collect();
            claimed_by_partition.push(slice.iter().map(|t| t.batch_id).collect::<Vec<_>>());
            handles.push(tokio::spawn(run_partition(
                self.lookup.clone(),
                self.quota.clone(),
                self.settings.lookup.clone(),
                *partition,
                self.settings.api_keys[partition.index].clone(),
                slice,
            )));
        }

        let mut results = Vec::with_capacity(targets.len());
        let mut unprocessed = Vec::new();
        for ((partition, claimed), joined) in partitions
            .iter()
            .zip(claimed_by_partition)
            .zip(join_all(handles).await)
        {
            match joined {
                Ok(run) => {
                    report.partitions.push(PartitionSummary {
                        partition: run.partition,
                        exit: run.exit.clone(),
                        processed: run.results.len(),
                        unprocessed: run.unprocessed.len(),
                    });
                    results.extend(run.results);
                    unprocessed.extend(run.unprocessed);
                }
                Err(err) => {
                    error!(?err, partition = partition.index, "partition task failed");
                    report.partitions.push(PartitionSummary {
                        partition: *partition,
                        exit: PartitionExit::Aborted(err.to_string()),
                        processed: 0,
                        unprocessed: claimed.len(),
                    });
                    unprocessed.extend(claimed);
                }
            }
        }

        for chunk in results.chunks(self.settings.chunk_size.max(1)) {
            match db::write_enrichment_chunk(&self.pool, chunk, policy, &mut publishers, &categories)
                .await
            {
                Ok(outcome) => report.outcome.merge(outcome),
                Err(err) => {
                    // Rolled back; the records go back to PENDING for the next run.
                    error!(?err, size = chunk.len(), "enrichment chunk write failed");
                    report.failed_chunks += 1;
                    unprocessed.extend(chunk.iter().map(EnrichmentResult::batch_id));
                }
            }
        }

        match db::release_claims(&self.pool, Stage::Enrichment, &unprocessed).await {
            Ok(released) => report.released = released as usize,
            Err(err) => warn!(?err, "failed to release unprocessed claims; next run will"),
        }

        report.quota_exhausted = self.quota.is_exhausted();
        info!(
            completed = report.outcome.completed,
            retried = report.outcome.retried,
            failed = report.outcome.failed,
            released = report.released,
            quota_exhausted = report.quota_exhausted,
            "enrichment run finished"
        );
        Ok(report)
    }
}
