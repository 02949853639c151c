//! Embedding pass: enriched records in, vectors out to the search index.

use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool, WriteOutcome};
use crate::embedding::EmbeddingService;
use crate::enrichment::PipelineSettings;
use crate::model::{EmbeddingFailure, EmbeddingTarget, RetryPolicy, SearchDocument, Stage};
use crate::search::SearchIndexer;

pub const TITLE_LABEL: &str = "Title:";
pub const DESCRIPTION_LABEL: &str = "Description:";
pub const AUTHORS_LABEL: &str = "Authors:";
pub const TAGS_LABEL: &str = "Tags:";

const EMPTY_EMBEDDING: &str = "empty embedding response";

/// Title, then description, authors and tags when present, each behind its
/// label. Embeddings are only reproducible while this stays byte-stable.
pub fn build_embedding_text(target: &EmbeddingTarget) -> String {
    let mut parts = vec![format!("{TITLE_LABEL} {}", target.title.trim())];
    if let Some(description) = target
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    {
        parts.push(format!("{DESCRIPTION_LABEL} {description}"));
    }
    if !target.authors.is_empty() {
        parts.push(format!("{AUTHORS_LABEL} {}", target.authors.join(", ")));
    }
    if !target.tags.is_empty() {
        parts.push(format!("{TAGS_LABEL} {}", target.tags.join(", ")));
    }
    parts.join(" ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddingReport {
    pub run_id: Uuid,
    pub claimed: usize,
    pub embedded: usize,
    pub indexed: usize,
    pub outcome: WriteOutcome,
}

pub struct EmbeddingGenerator {
    pool: Pool,
    embedder: Arc<dyn EmbeddingService>,
    indexer: Arc<dyn SearchIndexer>,
    permits: Arc<Semaphore>,
    batch_size: i64,
    policy: RetryPolicy,
    claim_lease: Duration,
}

impl EmbeddingGenerator {
    pub fn new(
        pool: Pool,
        embedder: Arc<dyn EmbeddingService>,
        indexer: Arc<dyn SearchIndexer>,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            pool,
            embedder,
            indexer,
            permits: Arc::new(Semaphore::new(settings.embedding_concurrency.max(1))),
            batch_size: settings.batch_size,
            policy: RetryPolicy::new(settings.embedding_retry_cap),
            claim_lease: settings.claim_lease,
        }
    }

    async fn embed_one(&self, target: &EmbeddingTarget) -> Result<SearchDocument, EmbeddingFailure> {
        let failure = |reason: String| EmbeddingFailure {
            book_id: target.book_id,
            batch_id: target.batch_id,
            retry_count: target.retry_count,
            reason,
        };
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| failure(e.to_string()))?;
        let text = build_embedding_text(target);
        match self.embedder.embed(&text).await {
            Ok(Some(vector)) if !vector.is_empty() => Ok(SearchDocument::from_target(target, vector)),
            Ok(_) => Err(failure(EMPTY_EMBEDDING.to_string())),
            Err(err) => Err(failure(err.to_string())),
        }
    }

    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self) -> Result<EmbeddingReport> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let mut report = EmbeddingReport {
            run_id,
            ..Default::default()
        };

        db::release_stale_claims(&self.pool, Stage::Embedding, self.claim_lease).await?;
        let targets = db::claim_embedding_batch(&self.pool, self.batch_size, self.policy.cap).await?;
        report.claimed = targets.len();
        if targets.is_empty() {
            info!("no pending embedding records");
            return Ok(report);
        }
        info!(claimed = targets.len(), "embedding run started");

        let mut documents = Vec::new();
        let mut failures = Vec::new();
        for outcome in join_all(targets.iter().map(|t| self.embed_one(t))).await {
            match outcome {
                Ok(doc) => documents.push(doc),
                Err(failure) => {
                    warn!(batch_id = failure.batch_id, reason = %failure.reason, "embedding failed");
                    failures.push(failure);
                }
            }
        }
        report.embedded = documents.len();

        let mut indexed = Vec::new();
        if !documents.is_empty() {
            match self.indexer.bulk_index(&documents).await {
                Ok(result) => {
                    let rejected: HashMap<i64, String> = result.failed.into_iter().collect();
                    for doc in documents {
                        match rejected.get(&doc.book_id) {
                            Some(reason) => failures.push(EmbeddingFailure {
                                book_id: doc.book_id,
                                batch_id: doc.batch_id,
                                retry_count: doc.retry_count,
                                reason: format!("index rejected: {reason}"),
                            }),
                            None => indexed.push(doc.batch_id),
                        }
                    }
                }
                Err(err) => {
                    error!(?err, "bulk index failed");
                    failures.extend(documents.into_iter().map(|doc| EmbeddingFailure {
                        book_id: doc.book_id,
                        batch_id: doc.batch_id,
                        retry_count: doc.retry_count,
                        reason: format!("bulk index failed: {err}"),
                    }));
                }
            }
        }
        report.indexed = indexed.len();

        report.outcome =
            db::write_embedding_results(&self.pool, &indexed, &failures, self.policy).await?;
        info!(
            completed = report.outcome.completed,
            retried = report.outcome.retried,
            failed = report.outcome.failed,
            "embedding run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> EmbeddingTarget {
        EmbeddingTarget {
            batch_id: 1,
            book_id: 7,
            title: " The Vegetarian ".into(),
            description: Some("A novel.".into()),
            authors: vec!["Han Kang".into(), "Deborah Smith".into()],
            tags: vec!["국내도서".into(), "소설".into()],
            ..Default::default()
        }
    }

    #[test]
    fn composite_text_order_and_labels() {
        assert_eq!(
            build_embedding_text(&target()),
            "Title: The Vegetarian Description: A novel. Authors: Han Kang, Deborah Smith Tags: 국내도서, 소설"
        );
    }

    #[test]
    fn composite_text_skips_missing_parts() {
        let mut t = target();
        t.description = Some("   ".into());
        t.authors.clear();
        assert_eq!(build_embedding_text(&t), "Title: The Vegetarian Tags: 국내도서, 소설");
        t.tags.clear();
        t.description = None;
        assert_eq!(build_embedding_text(&t), "Title: The Vegetarian");
    }

    #[test]
    fn composite_text_is_deterministic() {
        let t = target();
        let first = build_embedding_text(&t);
        for _ in 0..5 {
            assert_eq!(build_embedding_text(&t), first);
        }
    }
}
