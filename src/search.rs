//! Search index sink. Documents go out in one `_bulk` request per embedding
//! run; per-document failures come back so the caller can retry them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::model::SearchDocument;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkIndexReport {
    pub indexed: Vec<i64>,
    /// `(book_id, reason)` for every document the index rejected.
    pub failed: Vec<(i64, String)>,
}

#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn bulk_index(&self, documents: &[SearchDocument]) -> Result<BulkIndexReport>;
}

#[derive(Debug, Clone)]
pub struct BulkSearchClient {
    http: Client,
    base_url: Url,
    index: String,
}

impl BulkSearchClient {
    pub fn new(base_url: &str, index: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid search base URL")?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build search HTTP client")?;
        Ok(Self {
            http,
            base_url,
            index: index.to_string(),
        })
    }

    fn bulk_endpoint(&self) -> Result<Url> {
        self.base_url
            .join(&format!("{}/_bulk", self.index))
            .context("invalid search index name")
    }
}

/// NDJSON body: an `index` action line followed by the document, per document.
pub fn build_bulk_body(index: &str, documents: &[SearchDocument]) -> Result<String> {
    let mut body = String::new();
    for doc in documents {
        let action = json!({ "index": { "_index": index, "_id": doc.document_id() } });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&serde_json::to_string(doc).context("failed to encode search document")?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: Option<String>,
    status: u16,
    error: Option<serde_json::Value>,
}

/// Split a `_bulk` response into indexed and rejected book ids. Documents the
/// response does not mention count as failed.
pub fn parse_bulk_response(documents: &[SearchDocument], body: &str) -> Result<BulkIndexReport> {
    let response: BulkResponse =
        serde_json::from_str(body).context("malformed bulk response")?;
    let mut outcomes: HashMap<String, Option<String>> = HashMap::new();
    for item in response.items.into_iter().flat_map(|m| m.into_values()) {
        let Some(id) = item.id else { continue };
        let error = if (200..300).contains(&item.status) {
            None
        } else {
            Some(match item.error {
                Some(err) => err
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
                None => format!("index status {}", item.status),
            })
        };
        outcomes.insert(id, error);
    }

    let mut report = BulkIndexReport::default();
    for doc in documents {
        match outcomes.get(&doc.document_id()) {
            Some(None) => report.indexed.push(doc.book_id),
            Some(Some(reason)) => report.failed.push((doc.book_id, reason.clone())),
            None => report
                .failed
                .push((doc.book_id, "missing from bulk response".to_string())),
        }
    }
    Ok(report)
}

#[async_trait]
impl SearchIndexer for BulkSearchClient {
    #[instrument(skip_all, fields(documents = documents.len(), index = %self.index))]
    async fn bulk_index(&self, documents: &[SearchDocument]) -> Result<BulkIndexReport> {
        if documents.is_empty() {
            return Ok(BulkIndexReport::default());
        }
        let body = build_bulk_body(&self.index, documents)?;
        let res = self
            .http
            .post(self.bulk_endpoint()?)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .context("bulk index request failed")?;
        let status = res.status();
        let text = res.text().await.context("failed to read bulk response")?;
        if !status.is_success() {
            anyhow::bail!("bulk index returned {}: {}", status, text.chars().take(200).collect::<String>());
        }
        let report = parse_bulk_response(documents, &text)?;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "some documents were rejected by the index");
        }
        info!(indexed = report.indexed.len(), "bulk index finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(book_id: i64) -> SearchDocument {
        SearchDocument {
            batch_id: book_id + 100,
            retry_count: 0,
            book_id,
            isbn: Some(format!("97800000000{book_id:02}")),
            title: format!("Book {book_id}"),
            description: None,
            publisher: Some("Changbi".into()),
            authors: vec!["Han Kang".into()],
            tags: vec!["소설".into()],
            embedding: vec![0.5, -0.25],
        }
    }

    #[test]
    fn body_alternates_action_and_source_lines() {
        let body = build_bulk_body("books", &[doc(1), doc(2)]).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_id"], "1");
        assert_eq!(action["index"]["_index"], "books");
        let source: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(source["title"], "Book 1");
        assert_eq!(source["embedding"].as_array().unwrap().len(), 2);
        // internal bookkeeping stays out of the index
        assert!(source.get("batch_id").is_none());
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn response_splits_indexed_and_rejected() {
        let body = r#"{"took":3,"errors":true,"items":[
            {"index":{"_id":"1","status":201}},
            {"index":{"_id":"2","status":400,"error":{"type":"mapper_parsing_exception","reason":"bad vector"}}}
        ]}"#;
        let report = parse_bulk_response(&[doc(1), doc(2), doc(3)], body).unwrap();
        assert_eq!(report.indexed, vec![1]);
        assert_eq!(
            report.failed,
            vec![
                (2, "bad vector".to_string()),
                (3, "missing from bulk response".to_string())
            ]
        );
    }

    #[test]
    fn endpoint_joins_index_name() {
        let client = BulkSearchClient::new("http://search.test:9200/", "books", Duration::from_secs(5)).unwrap();
        assert_eq!(client.bulk_endpoint().unwrap().as_str(), "http://search.test:9200/books/_bulk");
    }
}
