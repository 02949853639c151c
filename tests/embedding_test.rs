use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use catalog_enricher::config;
use catalog_enricher::db;
use catalog_enricher::embedding::{EmbeddingError, EmbeddingGenerator, EmbeddingService};
use catalog_enricher::enrichment::PipelineSettings;
use catalog_enricher::model::{SearchDocument, StageStatus};
use catalog_enricher::search::{BulkIndexReport, SearchIndexer};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn settings() -> PipelineSettings {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.pipeline_settings()
}

/// Registers a book and marks its enrichment as done.
async fn enriched_book(pool: &sqlx::SqlitePool, isbn: &str, title: &str) -> (i64, i64) {
    let (book_id, batch_id) = db::register_book(pool, Some(isbn), title).await.unwrap();
    sqlx::query("UPDATE batch_records SET enrichment_status = 'COMPLETED' WHERE id = ?")
        .bind(batch_id)
        .execute(pool)
        .await
        .unwrap();
    (book_id, batch_id)
}

type Scripted = Result<Option<Vec<f32>>, EmbeddingError>;

#[derive(Clone, Default)]
struct RecordingEmbedder {
    responses: Arc<Mutex<VecDeque<Scripted>>>,
    texts: Arc<Mutex<Vec<String>>>,
}

impl RecordingEmbedder {
    fn with_responses(responses: Vec<Scripted>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingService for RecordingEmbedder {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        self.texts.lock().await.push(text.to_string());
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok(Some(vec![0.25, 0.5, 0.75])))
    }
}

#[derive(Clone, Default)]
struct RecordingIndexer {
    reject: HashSet<i64>,
    fail_all: bool,
    batches: Arc<Mutex<Vec<Vec<SearchDocument>>>>,
}

#[async_trait::async_trait]
impl SearchIndexer for RecordingIndexer {
    async fn bulk_index(&self, documents: &[SearchDocument]) -> Result<BulkIndexReport> {
        self.batches.lock().await.push(documents.to_vec());
        if self.fail_all {
            return Err(anyhow!("connection refused"));
        }
        let mut report = BulkIndexReport::default();
        for doc in documents {
            if self.reject.contains(&doc.book_id) {
                report.failed.push((doc.book_id, "mapping conflict".into()));
            } else {
                report.indexed.push(doc.book_id);
            }
        }
        Ok(report)
    }
}

/// Holds every call open for a moment and records how many overlapped.
#[derive(Clone, Default)]
struct SlowEmbedder {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl EmbeddingService for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, EmbeddingError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(vec![1.0]))
    }
}

fn generator(
    pool: &sqlx::SqlitePool,
    embedder: &RecordingEmbedder,
    indexer: &RecordingIndexer,
) -> EmbeddingGenerator {
    EmbeddingGenerator::new(
        pool.clone(),
        Arc::new(embedder.clone()),
        Arc::new(indexer.clone()),
        &settings(),
    )
}

#[tokio::test]
async fn empty_response_retries_then_fails_at_cap() {
    let pool = setup_pool().await;
    let (_, batch_id) = enriched_book(&pool, "9780000000002", "Quiet").await;
    sqlx::query("UPDATE batch_records SET embedding_retry_count = 2 WHERE id = ?")
        .bind(batch_id)
        .execute(&pool)
        .await
        .unwrap();

    let embedder = RecordingEmbedder::with_responses(vec![Ok(None), Ok(Some(Vec::new()))]);
    let indexer = RecordingIndexer::default();
    let generator = generator(&pool, &embedder, &indexer);

    let report = generator.run().await.unwrap();
    assert_eq!(report.outcome.retried, 1);
    let record = db::fetch_batch_record(&pool, batch_id).await.unwrap();
    assert_eq!(record.embedding_status, StageStatus::Pending);
    assert_eq!(record.embedding_retry_count, 3);
    assert_eq!(record.embedding_error.as_deref(), Some("empty embedding response"));

    let report = generator.run().await.unwrap();
    assert_eq!(report.outcome.failed, 1);
    let record = db::fetch_batch_record(&pool, batch_id).await.unwrap();
    assert_eq!(record.embedding_status, StageStatus::Failed);
    assert_eq!(record.embedding_retry_count, 3);
    assert_eq!(record.enrichment_status, StageStatus::Completed);

    // nothing was worth indexing
    assert!(indexer.batches.lock().await.is_empty());
}

#[tokio::test]
async fn successes_are_indexed_in_one_call() {
    let pool = setup_pool().await;
    let (book_a, batch_a) = enriched_book(&pool, "9780000000501", "A").await;
    let (book_b, batch_b) = enriched_book(&pool, "9780000000502", "B").await;
    let (_, untouched) = db::register_book(&pool, Some("9780000000503"), "Not enriched")
        .await
        .unwrap();

    let embedder = RecordingEmbedder::default();
    let indexer = RecordingIndexer {
        reject: HashSet::from([book_b]),
        ..Default::default()
    };
    let report = generator(&pool, &embedder, &indexer).run().await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.embedded, 2);
    assert_eq!(report.indexed, 1);

    let batches = indexer.batches.lock().await.clone();
    assert_eq!(batches.len(), 1);
    let mut indexed: Vec<i64> = batches[0].iter().map(|d| d.book_id).collect();
    indexed.sort();
    assert_eq!(indexed, vec![book_a, book_b]);

    let a = db::fetch_batch_record(&pool, batch_a).await.unwrap();
    assert_eq!(a.embedding_status, StageStatus::Completed);
    let b = db::fetch_batch_record(&pool, batch_b).await.unwrap();
    assert_eq!(b.embedding_status, StageStatus::Pending);
    assert_eq!(b.embedding_retry_count, 1);
    assert!(b.embedding_error.unwrap().contains("mapping conflict"));

    let other = db::fetch_batch_record(&pool, untouched).await.unwrap();
    assert_eq!(other.embedding_status, StageStatus::Pending);
    assert_eq!(embedder.texts.lock().await.len(), 2);
}

#[tokio::test]
async fn index_outage_sends_every_document_back_for_retry() {
    let pool = setup_pool().await;
    let (_, batch_id) = enriched_book(&pool, "9780000000601", "Down").await;

    let embedder = RecordingEmbedder::default();
    let indexer = RecordingIndexer {
        fail_all: true,
        ..Default::default()
    };
    let report = generator(&pool, &embedder, &indexer).run().await.unwrap();
    assert_eq!(report.indexed, 0);
    assert_eq!(report.outcome.retried, 1);

    let record = db::fetch_batch_record(&pool, batch_id).await.unwrap();
    assert_eq!(record.embedding_status, StageStatus::Pending);
    assert_eq!(record.embedding_retry_count, 1);
}

#[tokio::test]
async fn composite_text_uses_enriched_fields() {
    let pool = setup_pool().await;
    let (book_id, _) = enriched_book(&pool, "9780000000701", "The Vegetarian").await;
    sqlx::query("UPDATE books SET description = 'A novel.' WHERE id = ?")
        .bind(book_id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO authors (name) VALUES ('Han Kang')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO book_authors (book_id, author_id, role) SELECT ?, id, 'Author' FROM authors")
        .bind(book_id)
        .execute(&pool)
        .await
        .unwrap();

    let embedder = RecordingEmbedder::default();
    let indexer = RecordingIndexer::default();
    generator(&pool, &embedder, &indexer).run().await.unwrap();

    let texts = embedder.texts.lock().await.clone();
    assert_eq!(
        texts,
        vec!["Title: The Vegetarian Description: A novel. Authors: Han Kang".to_string()]
    );
    let doc = &indexer.batches.lock().await[0][0];
    assert_eq!(doc.authors, vec!["Han Kang".to_string()]);
    assert_eq!(doc.embedding.len(), 3);
}

#[tokio::test]
async fn purge_removes_fully_processed_records() {
    let pool = setup_pool().await;
    let (_, done) = enriched_book(&pool, "9780000000801", "Done").await;
    let (_, pending) = db::register_book(&pool, Some("9780000000802"), "Pending")
        .await
        .unwrap();

    generator(&pool, &RecordingEmbedder::default(), &RecordingIndexer::default())
        .run()
        .await
        .unwrap();

    let summary = db::stage_summary(&pool).await.unwrap();
    assert_eq!(
        summary.count(catalog_enricher::model::Stage::Embedding, StageStatus::Completed),
        1
    );
    assert_eq!(db::purge_completed(&pool).await.unwrap(), 1);
    assert!(db::fetch_batch_record(&pool, done).await.is_err());
    assert!(db::fetch_batch_record(&pool, pending).await.is_ok());
}

#[tokio::test]
async fn live_embedding_claims_survive_a_second_run() {
    let pool = setup_pool().await;
    let (_, batch_id) = enriched_book(&pool, "9780000000901", "Held").await;
    let held = db::claim_embedding_batch(&pool, 10, 3).await.unwrap();
    assert_eq!(held.len(), 1);

    let embedder = RecordingEmbedder::default();
    let indexer = RecordingIndexer::default();
    let report = generator(&pool, &embedder, &indexer).run().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert!(embedder.texts.lock().await.is_empty());
    let record = db::fetch_batch_record(&pool, batch_id).await.unwrap();
    assert_eq!(record.embedding_status, StageStatus::InProgress);
}

#[tokio::test]
async fn embedding_calls_respect_concurrency_limit() {
    let pool = setup_pool().await;
    for n in 0..10 {
        enriched_book(&pool, &format!("97800000011{n:02}"), &format!("Book {n}")).await;
    }
    let mut settings = settings();
    settings.embedding_concurrency = 3;

    let embedder = SlowEmbedder::default();
    let indexer = RecordingIndexer::default();
    let report = EmbeddingGenerator::new(
        pool.clone(),
        Arc::new(embedder.clone()),
        Arc::new(indexer.clone()),
        &settings,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.claimed, 10);
    assert_eq!(report.indexed, 10);
    let peak = embedder.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert!(peak > 1, "calls never overlapped");
}
