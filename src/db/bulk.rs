//! Bulk-write phases. Each call is a single transaction: reference rows are
//! inserted before the association rows that point at them, and a failure
//! anywhere rolls the whole chunk back.

use anyhow::{Context, Result};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

use super::model::WriteOutcome;
use super::repo::{push_id_list, Pool};
use crate::cache::{clean_name, CategoryCache, PublisherCache};
use crate::extract::is_placeholder_cover;
use crate::model::{
    BookFields, EmbeddingFailure, EnrichmentResult, RetryPolicy, Stage, Transition,
};

/// A failed attempt as the status update sees it.
#[derive(Debug, Clone)]
pub struct FailedAttempt<'a> {
    pub batch_id: i64,
    pub retry_count: i64,
    pub reason: &'a str,
    pub retryable: bool,
}

/// Insert-ignore `names` into a `(id, name UNIQUE)` table and return the ids
/// of every name that resolved. Names whose insert was lost simply do not
/// appear in the map.
pub async fn upsert_names(
    conn: &mut SqliteConnection,
    table: &str,
    names: &[String],
) -> Result<HashMap<String, i64>> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }
    let mut insert = QueryBuilder::<Sqlite>::new(format!("INSERT OR IGNORE INTO {table} (name) "));
    insert.push_values(names, |mut b, name| {
        b.push_bind(name.clone());
    });
    insert
        .build()
        .execute(&mut *conn)
        .await
        .with_context(|| format!("failed to insert into {table}"))?;

    let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT id, name FROM {table} WHERE name IN ("));
    {
        let mut separated = select.separated(", ");
        for name in names {
            separated.push_bind(name.clone());
        }
    }
    select.push(")");
    let rows = select.build().fetch_all(&mut *conn).await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>("name"), row.get::<i64, _>("id")))
        .collect())
}

/// Apply the stage state machine to failed attempts.
pub async fn apply_failures(
    conn: &mut SqliteConnection,
    stage: Stage,
    policy: RetryPolicy,
    failures: &[FailedAttempt<'_>],
) -> Result<WriteOutcome> {
    let mut outcome = WriteOutcome::default();
    let retry_sql = format!(
        "UPDATE batch_records SET {status} = 'PENDING', {retry} = ?, {error} = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        status = stage.status_column(),
        retry = stage.retry_column(),
        error = stage.error_column(),
    );
    // FAILED keeps the counter the attempt was made with.
    let fail_sql = format!(
        "UPDATE batch_records SET {status} = 'FAILED', {retry} = ?, {error} = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        status = stage.status_column(),
        retry = stage.retry_column(),
        error = stage.error_column(),
    );

    for failure in failures {
        let transition = if failure.retryable {
            policy.on_failure(failure.retry_count)
        } else {
            Transition::Fail
        };
        match transition {
            Transition::Retry { retry_count } => {
                sqlx::query(&retry_sql)
                    .bind(retry_count)
                    .bind(failure.reason)
                    .bind(failure.batch_id)
                    .execute(&mut *conn)
                    .await?;
                outcome.retried += 1;
            }
            Transition::Fail => {
                sqlx::query(&fail_sql)
                    .bind(failure.retry_count)
                    .bind(failure.reason)
                    .bind(failure.batch_id)
                    .execute(&mut *conn)
                    .await?;
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

async fn mark_completed(conn: &mut SqliteConnection, stage: Stage, ids: &[i64]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new(format!(
        "UPDATE batch_records SET {status} = 'COMPLETED', {error} = NULL, updated_at = CURRENT_TIMESTAMP WHERE id IN (",
        status = stage.status_column(),
        error = stage.error_column(),
    ));
    push_id_list(&mut qb, ids);
    if stage == Stage::Embedding {
        qb.push(" AND enrichment_status = 'COMPLETED'");
    }
    Ok(qb.build().execute(&mut *conn).await?.rows_affected() as usize)
}

struct BookUpdate<'a> {
    book_id: i64,
    fields: &'a BookFields,
    publisher_id: Option<i64>,
    category_id: Option<i64>,
}

/// One UPDATE for the whole chunk. Values the lookup did not supply leave the
/// stored column alone.
async fn update_books(conn: &mut SqliteConnection, updates: &[BookUpdate<'_>]) -> Result<()> {
    if updates.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Sqlite>::new(
        "UPDATE books SET \
            description = COALESCE(v.column2, books.description), \
            price = COALESCE(v.column3, books.price), \
            publish_date = COALESCE(v.column4, books.publish_date), \
            subtitle = COALESCE(v.column5, books.subtitle), \
            page_count = COALESCE(v.column6, books.page_count), \
            table_of_contents = COALESCE(v.column7, books.table_of_contents), \
            language = COALESCE(v.column8, books.language), \
            publisher_id = COALESCE(v.column9, books.publisher_id), \
            category_id = COALESCE(v.column10, books.category_id), \
            updated_at = CURRENT_TIMESTAMP \
         FROM (",
    );
    qb.push_values(updates, |mut b, u| {
        b.push_bind(u.book_id)
            .push_bind(u.fields.description.clone())
            .push_bind(u.fields.price)
            .push_bind(u.fields.publish_date.map(|d| d.format("%Y-%m-%d").to_string()))
            .push_bind(u.fields.subtitle.clone())
            .push_bind(u.fields.page_count)
            .push_bind(u.fields.table_of_contents.clone())
            .push_bind(u.fields.language.clone())
            .push_bind(u.publisher_id)
            .push_bind(u.category_id);
    });
    qb.push(") AS v WHERE books.id = v.column1");
    qb.build()
        .execute(&mut *conn)
        .await
        .context("failed to update books")?;
    Ok(())
}

fn distinct<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .map(clean_name)
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

/// Persist one chunk of enrichment results.
///
/// `publishers` is replaced by a freshly loaded cache only after the
/// transaction commits, so a rolled back chunk can never leave ids of
/// vanished rows behind in it.
#[instrument(skip_all, fields(results = results.len()))]
pub async fn write_enrichment_chunk(
    pool: &Pool,
    results: &[EnrichmentResult],
    policy: RetryPolicy,
    publishers: &mut PublisherCache,
    categories: &CategoryCache,
) -> Result<WriteOutcome> {
    let successes: Vec<(i64, i64, &BookFields)> = results
        .iter()
        .filter_map(|r| match r {
            EnrichmentResult::Success {
                book_id,
                batch_id,
                fields,
            } => Some((*book_id, *batch_id, fields.as_ref())),
            EnrichmentResult::Failure { .. } => None,
        })
        .collect();

    let mut tx = pool.begin().await?;

    // Parents first.
    let author_names = distinct(
        successes
            .iter()
            .flat_map(|(_, _, f)| f.authors.iter().map(|a| a.name.as_str())),
    );
    let author_ids = upsert_names(&mut tx, "authors", &author_names).await?;
    let tag_names = distinct(
        successes
            .iter()
            .flat_map(|(_, _, f)| f.tags.iter().map(String::as_str)),
    );
    let tag_ids = upsert_names(&mut tx, "tags", &tag_names).await?;

    let missing = publishers.missing(successes.iter().filter_map(|(_, _, f)| f.publisher.as_deref()));
    let rebuilt = if missing.is_empty() {
        None
    } else {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT OR IGNORE INTO publishers (name, normalized_name) ",
        );
        qb.push_values(&missing, |mut b, (name, key)| {
            b.push_bind(name.clone()).push_bind(key.clone());
        });
        qb.build()
            .execute(&mut *tx)
            .await
            .context("failed to insert publishers")?;
        debug!(inserted = missing.len(), "publishers created");
        Some(PublisherCache::load(&mut tx).await?)
    };
    let publisher_cache: &PublisherCache = rebuilt.as_ref().unwrap_or(&*publishers);

    // Children.
    let mut book_authors: Vec<(i64, i64, Option<String>)> = Vec::new();
    let mut book_tags: Vec<(i64, i64)> = Vec::new();
    let mut covers: Vec<(i64, String)> = Vec::new();
    for (book_id, _, fields) in &successes {
        for credit in &fields.authors {
            if let Some(author_id) = author_ids.get(&clean_name(&credit.name)) {
                book_authors.push((*book_id, *author_id, credit.role.clone()));
            }
        }
        for tag in &fields.tags {
            if let Some(tag_id) = tag_ids.get(&clean_name(tag)) {
                book_tags.push((*book_id, *tag_id));
            }
        }
        if let Some(url) = fields.cover_url.as_deref().filter(|u| !is_placeholder_cover(u)) {
            covers.push((*book_id, url.trim().to_string()));
        }
    }

    if !book_authors.is_empty() {
        let mut qb =
            QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO book_authors (book_id, author_id, role) ");
        qb.push_values(&book_authors, |mut b, (book_id, author_id, role)| {
            b.push_bind(*book_id)
                .push_bind(*author_id)
                .push_bind(role.clone());
        });
        qb.build().execute(&mut *tx).await?;
    }
    if !book_tags.is_empty() {
        let mut qb = QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO book_tags (book_id, tag_id) ");
        qb.push_values(&book_tags, |mut b, (book_id, tag_id)| {
            b.push_bind(*book_id).push_bind(*tag_id);
        });
        qb.build().execute(&mut *tx).await?;
    }

    let updates: Vec<BookUpdate<'_>> = successes
        .iter()
        .map(|(book_id, _, fields)| BookUpdate {
            book_id: *book_id,
            fields: *fields,
            publisher_id: fields
                .publisher
                .as_deref()
                .and_then(|p| publisher_cache.find(p))
                .map(|p| p.id),
            category_id: categories.resolve_tags(&fields.tags).map(|c| c.id),
        })
        .collect();
    update_books(&mut tx, &updates).await?;

    if !covers.is_empty() {
        let mut qb =
            QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO book_images (book_id, url, kind) ");
        qb.push_values(&covers, |mut b, (book_id, url)| {
            b.push_bind(*book_id).push_bind(url.clone()).push_bind("COVER");
        });
        qb.build().execute(&mut *tx).await?;
    }

    // Batch record transitions last.
    let completed_ids: Vec<i64> = successes.iter().map(|(_, batch_id, _)| *batch_id).collect();
    let mut outcome = WriteOutcome {
        completed: mark_completed(&mut tx, Stage::Enrichment, &completed_ids).await?,
        ..Default::default()
    };
    let failures: Vec<FailedAttempt<'_>> = results
        .iter()
        .filter_map(|r| match r {
            EnrichmentResult::Failure {
                batch_id,
                reason,
                kind,
                retry_count,
                ..
            } => Some(FailedAttempt {
                batch_id: *batch_id,
                retry_count: *retry_count,
                reason,
                retryable: kind.is_retryable(),
            }),
            EnrichmentResult::Success { .. } => None,
        })
        .collect();
    outcome.merge(apply_failures(&mut tx, Stage::Enrichment, policy, &failures).await?);

    tx.commit().await.context("failed to commit enrichment chunk")?;
    if let Some(cache) = rebuilt {
        *publishers = cache;
    }
    debug!(
        completed = outcome.completed,
        retried = outcome.retried,
        failed = outcome.failed,
        authors = author_names.len(),
        tags = tag_names.len(),
        "enrichment chunk written"
    );
    Ok(outcome)
}

/// Persist the embedding stage outcome: indexed records become COMPLETED,
/// failures go through the retry-cap rule.
#[instrument(skip_all, fields(indexed = indexed_batch_ids.len(), failed = failures.len()))]
pub async fn write_embedding_results(
    pool: &Pool,
    indexed_batch_ids: &[i64],
    failures: &[EmbeddingFailure],
    policy: RetryPolicy,
) -> Result<WriteOutcome> {
    let mut tx = pool.begin().await?;
    let mut outcome = WriteOutcome {
        completed: mark_completed(&mut tx, Stage::Embedding, indexed_batch_ids).await?,
        ..Default::default()
    };
    let attempts: Vec<FailedAttempt<'_>> = failures
        .iter()
        .map(|f| FailedAttempt {
            batch_id: f.batch_id,
            retry_count: f.retry_count,
            reason: &f.reason,
            retryable: true,
        })
        .collect();
    outcome.merge(apply_failures(&mut tx, Stage::Embedding, policy, &attempts).await?);
    tx.commit().await.context("failed to commit embedding results")?;
    Ok(outcome)
}
