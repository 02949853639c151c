use super::model::{BatchRecordRow, StageSummary};
use crate::model::{EmbeddingTarget, EnrichmentTarget, Stage, StageStatus};
use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass
/// through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded_path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Entry point for the catalog ingestion collaborator: creates the book (or
/// finds it by ISBN) and its batch record. Returns `(book_id, batch_id)`.
#[instrument(skip_all)]
pub async fn register_book(pool: &Pool, isbn: Option<&str>, title: &str) -> Result<(i64, i64)> {
    let isbn = isbn.map(str::trim).filter(|s| !s.is_empty());
    let mut tx = pool.begin().await?;

    let existing = match isbn {
        Some(isbn) => {
            sqlx::query_scalar::<_, i64>("SELECT id FROM books WHERE isbn = ?")
                .bind(isbn)
                .fetch_optional(&mut *tx)
                .await?
        }
        None => None,
    };
    let book_id = match existing {
        Some(id) => id,
        None => sqlx::query("INSERT INTO books (isbn, title) VALUES (?, ?) RETURNING id")
            .bind(isbn)
            .bind(title)
            .fetch_one(&mut *tx)
            .await?
            .get("id"),
    };

    sqlx::query("INSERT OR IGNORE INTO batch_records (book_id) VALUES (?)")
        .bind(book_id)
        .execute(&mut *tx)
        .await?;
    let batch_id: i64 = sqlx::query_scalar("SELECT id FROM batch_records WHERE book_id = ?")
        .bind(book_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok((book_id, batch_id))
}

/// Put records a crashed run left IN_PROGRESS back to PENDING. Only claims
/// older than `lease` are touched; younger ones belong to a run that may
/// still be working on them.
#[instrument(skip_all)]
pub async fn release_stale_claims(pool: &Pool, stage: Stage, lease: Duration) -> Result<u64> {
    let sql = format!(
        "UPDATE batch_records SET {status} = 'PENDING', updated_at = CURRENT_TIMESTAMP \
         WHERE {status} = 'IN_PROGRESS' AND updated_at <= datetime('now', ?)",
        status = stage.status_column()
    );
    let released = sqlx::query(&sql)
        .bind(format!("-{} seconds", lease.as_secs()))
        .execute(pool)
        .await?
        .rows_affected();
    if released > 0 {
        info!(stage = stage.as_str(), released, "released stale claims");
    }
    Ok(released)
}

/// Release specific claims without touching their retry counters.
#[instrument(skip_all)]
pub async fn release_claims(pool: &Pool, stage: Stage, batch_ids: &[i64]) -> Result<u64> {
    if batch_ids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "UPDATE batch_records SET {status} = 'PENDING', updated_at = CURRENT_TIMESTAMP WHERE {status} = 'IN_PROGRESS' AND id IN (",
        status = stage.status_column()
    ));
    push_id_list(&mut qb, batch_ids);
    Ok(qb.build().execute(pool).await?.rows_affected())
}

/// Append `id, id, ...)` to an open `IN (` clause.
pub(crate) fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

async fn mark_in_progress(conn: &mut SqliteConnection, stage: Stage, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "UPDATE batch_records SET {status} = 'IN_PROGRESS', updated_at = CURRENT_TIMESTAMP WHERE {status} = 'PENDING' AND id IN (",
        status = stage.status_column()
    ));
    push_id_list(&mut qb, ids);
    qb.build().execute(&mut *conn).await?;
    Ok(())
}

/// Take up to `limit` PENDING enrichment records, lowest id first, and mark
/// them IN_PROGRESS in the same transaction.
#[instrument(skip_all)]
pub async fn claim_enrichment_batch(
    pool: &Pool,
    limit: i64,
    retry_cap: i64,
) -> Result<Vec<EnrichmentTarget>> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(
        "SELECT br.id, br.book_id, b.isbn, br.enrichment_retry_count \
         FROM batch_records br JOIN books b ON b.id = br.book_id \
         WHERE br.enrichment_status = 'PENDING' AND br.enrichment_retry_count <= ? \
         ORDER BY br.id ASC LIMIT ?",
    )
    .bind(retry_cap)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await
    .context("failed to read pending enrichment records")?;

    let targets: Vec<EnrichmentTarget> = rows
        .into_iter()
        .map(|row| EnrichmentTarget {
            batch_id: row.get("id"),
            book_id: row.get("book_id"),
            isbn: row
                .try_get::<Option<String>, _>("isbn")
                .ok()
                .flatten()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            retry_count: row.get("enrichment_retry_count"),
        })
        .collect();

    let ids: Vec<i64> = targets.iter().map(|t| t.batch_id).collect();
    mark_in_progress(&mut tx, Stage::Enrichment, &ids).await?;
    tx.commit().await?;
    Ok(targets)
}

/// Take up to `limit` enriched records whose embedding is PENDING, with the
/// inputs of their composite text, and mark them IN_PROGRESS.
#[instrument(skip_all)]
pub async fn claim_embedding_batch(
    pool: &Pool,
    limit: i64,
    retry_cap: i64,
) -> Result<Vec<EmbeddingTarget>> {
    let mut tx = pool.begin().await?;
    let rows = sqlx::query(
        "SELECT br.id, br.book_id, br.embedding_retry_count, b.isbn, b.title, b.description, \
                p.name AS publisher \
         FROM batch_records br \
         JOIN books b ON b.id = br.book_id \
         LEFT JOIN publishers p ON p.id = b.publisher_id \
         WHERE br.enrichment_status = 'COMPLETED' AND br.embedding_status = 'PENDING' \
           AND br.embedding_retry_count <= ? \
         ORDER BY br.id ASC LIMIT ?",
    )
    .bind(retry_cap)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await
    .context("failed to read pending embedding records")?;

    let mut targets: Vec<EmbeddingTarget> = rows.into_iter().map(embedding_target).collect();
    if targets.is_empty() {
        tx.commit().await?;
        return Ok(targets);
    }

    let book_ids: Vec<i64> = targets.iter().map(|t| t.book_id).collect();
    let mut authors = names_by_book(
        &mut tx,
        "SELECT ba.book_id, a.name FROM book_authors ba JOIN authors a ON a.id = ba.author_id WHERE ba.book_id IN (",
        ") ORDER BY ba.book_id, ba.rowid",
        &book_ids,
    )
    .await?;
    let mut tags = names_by_book(
        &mut tx,
        "SELECT bt.book_id, t.name FROM book_tags bt JOIN tags t ON t.id = bt.tag_id WHERE bt.book_id IN (",
        ") ORDER BY bt.book_id, bt.rowid",
        &book_ids,
    )
    .await?;
    for target in &mut targets {
        target.authors = authors.remove(&target.book_id).unwrap_or_default();
        target.tags = tags.remove(&target.book_id).unwrap_or_default();
    }

    let ids: Vec<i64> = targets.iter().map(|t| t.batch_id).collect();
    mark_in_progress(&mut tx, Stage::Embedding, &ids).await?;
    tx.commit().await?;
    Ok(targets)
}

fn embedding_target(row: SqliteRow) -> EmbeddingTarget {
    EmbeddingTarget {
        batch_id: row.get("id"),
        book_id: row.get("book_id"),
        retry_count: row.get("embedding_retry_count"),
        isbn: row.try_get::<Option<String>, _>("isbn").ok().flatten(),
        title: row.get("title"),
        description: row.try_get::<Option<String>, _>("description").ok().flatten(),
        publisher: row.try_get::<Option<String>, _>("publisher").ok().flatten(),
        authors: Vec::new(),
        tags: Vec::new(),
    }
}

async fn names_by_book(
    conn: &mut SqliteConnection,
    head: &str,
    tail: &str,
    book_ids: &[i64],
) -> Result<HashMap<i64, Vec<String>>> {
    let mut qb = QueryBuilder::<Sqlite>::new(head);
    {
        let mut separated = qb.separated(", ");
        for id in book_ids {
            separated.push_bind(*id);
        }
    }
    qb.push(tail);
    let rows = qb.build().fetch_all(&mut *conn).await?;
    let mut out: HashMap<i64, Vec<String>> = HashMap::new();
    for row in rows {
        out.entry(row.get("book_id"))
            .or_default()
            .push(row.get("name"));
    }
    Ok(out)
}

pub async fn fetch_batch_record(pool: &Pool, batch_id: i64) -> Result<BatchRecordRow> {
    let row = sqlx::query(
        "SELECT id, book_id, enrichment_status, enrichment_retry_count, enrichment_error, \
                embedding_status, embedding_retry_count, embedding_error \
         FROM batch_records WHERE id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Err(anyhow!("batch record {} not found", batch_id));
    };

    let status = |column: &str| -> Result<StageStatus> {
        let raw: String = row.get(column);
        StageStatus::parse_status(&raw)
            .ok_or_else(|| anyhow!("batch record {} has unknown {} {}", batch_id, column, raw))
    };

    Ok(BatchRecordRow {
        id: row.get("id"),
        book_id: row.get("book_id"),
        enrichment_status: status("enrichment_status")?,
        enrichment_retry_count: row.get("enrichment_retry_count"),
        enrichment_error: row.try_get("enrichment_error").ok().flatten(),
        embedding_status: status("embedding_status")?,
        embedding_retry_count: row.get("embedding_retry_count"),
        embedding_error: row.try_get("embedding_error").ok().flatten(),
    })
}

#[instrument(skip_all)]
pub async fn stage_summary(pool: &Pool) -> Result<StageSummary> {
    let mut summary = StageSummary::default();
    for stage in [Stage::Enrichment, Stage::Embedding] {
        let sql = format!(
            "SELECT {status} AS status, COUNT(*) AS n FROM batch_records GROUP BY {status}",
            status = stage.status_column()
        );
        let rows = sqlx::query(&sql).fetch_all(pool).await?;
        for row in rows {
            let raw: String = row.get("status");
            if let Some(status) = StageStatus::parse_status(&raw) {
                summary.rows.push((stage, status, row.get("n")));
            }
        }
    }
    Ok(summary)
}

/// Remove batch records whose two stages are COMPLETED.
#[instrument(skip_all)]
pub async fn purge_completed(pool: &Pool) -> Result<u64> {
    let purged = sqlx::query(
        "DELETE FROM batch_records WHERE enrichment_status = 'COMPLETED' AND embedding_status = 'COMPLETED'",
    )
    .execute(pool)
    .await?
    .rows_affected();
    info!(purged, "purged completed batch records");
    Ok(purged)
}
