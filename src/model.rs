use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Status of one pipeline stage on a batch record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::InProgress => "IN_PROGRESS",
            StageStatus::Completed => "COMPLETED",
            StageStatus::Failed => "FAILED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(StageStatus::Pending),
            "IN_PROGRESS" => Some(StageStatus::InProgress),
            "COMPLETED" => Some(StageStatus::Completed),
            "FAILED" => Some(StageStatus::Failed),
            _ => None,
        }
    }
}

/// The two independent stages tracked on every batch record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Stage {
    Enrichment,
    Embedding,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Enrichment => "enrichment",
            Stage::Embedding => "embedding",
        }
    }

    pub(crate) fn status_column(&self) -> &'static str {
        match self {
            Stage::Enrichment => "enrichment_status",
            Stage::Embedding => "embedding_status",
        }
    }

    pub(crate) fn retry_column(&self) -> &'static str {
        match self {
            Stage::Enrichment => "enrichment_retry_count",
            Stage::Embedding => "embedding_retry_count",
        }
    }

    pub(crate) fn error_column(&self) -> &'static str {
        match self {
            Stage::Enrichment => "enrichment_error",
            Stage::Embedding => "embedding_error",
        }
    }
}

/// Guard on the failure edge of a stage: decides whether a failed attempt
/// sends the record back to PENDING or terminates it as FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub cap: i64,
}

/// Outcome of applying a [`RetryPolicy`] to one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Back to PENDING with the incremented retry count.
    Retry { retry_count: i64 },
    /// Terminal FAILED; the retry count is left where it was.
    Fail,
}

impl RetryPolicy {
    pub fn new(cap: i64) -> Self {
        Self { cap: cap.max(0) }
    }

    /// A record whose counter already reached the cap fails on this attempt;
    /// otherwise the counter grows by one and the record stays retryable.
    pub fn on_failure(&self, retry_count: i64) -> Transition {
        if retry_count >= self.cap {
            Transition::Fail
        } else {
            Transition::Retry {
                retry_count: retry_count + 1,
            }
        }
    }
}

/// Enrichment work item: a claimed batch record joined with its book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentTarget {
    pub batch_id: i64,
    pub book_id: i64,
    pub isbn: Option<String>,
    pub retry_count: i64,
}

/// Author credit as extracted from a lookup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorCredit {
    pub name: String,
    pub role: Option<String>,
}

impl AuthorCredit {
    pub fn new(name: impl Into<String>, role: Option<&str>) -> Self {
        Self {
            name: name.into(),
            role: role.map(str::to_string),
        }
    }
}

/// Mapped enrichment payload. Every field is optional: a lookup with no
/// match still completes the record with nothing set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookFields {
    pub description: Option<String>,
    pub price: Option<i64>,
    pub publish_date: Option<NaiveDate>,
    pub subtitle: Option<String>,
    pub page_count: Option<i64>,
    pub table_of_contents: Option<String>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub cover_url: Option<String>,
    pub authors: Vec<AuthorCredit>,
    pub tags: Vec<String>,
}

/// Why a record failed, which also decides how the write phase treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No identifier to look up; terminal right away.
    MissingInput,
    /// Network or timeout after in-process retries; counted.
    Transport,
    /// Error code or malformed body; counted.
    Application,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::MissingInput)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentResult {
    Success {
        book_id: i64,
        batch_id: i64,
        fields: Box<BookFields>,
    },
    Failure {
        book_id: i64,
        batch_id: i64,
        reason: String,
        kind: FailureKind,
        retry_count: i64,
    },
}

impl EnrichmentResult {
    pub fn batch_id(&self) -> i64 {
        match self {
            EnrichmentResult::Success { batch_id, .. } => *batch_id,
            EnrichmentResult::Failure { batch_id, .. } => *batch_id,
        }
    }
}

/// Embedding work item: an enriched book with the inputs of its composite text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddingTarget {
    pub batch_id: i64,
    pub book_id: i64,
    pub retry_count: i64,
    pub isbn: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub publisher: Option<String>,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingFailure {
    pub book_id: i64,
    pub batch_id: i64,
    pub retry_count: i64,
    pub reason: String,
}

/// Document handed to the search index, keyed by book id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    #[serde(skip)]
    pub batch_id: i64,
    #[serde(skip)]
    pub retry_count: i64,
    pub book_id: i64,
    pub isbn: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub publisher: Option<String>,
    pub authors: Vec<String>,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
}

impl SearchDocument {
    pub fn from_target(target: &EmbeddingTarget, embedding: Vec<f32>) -> Self {
        Self {
            batch_id: target.batch_id,
            retry_count: target.retry_count,
            book_id: target.book_id,
            isbn: target.isbn.clone(),
            title: target.title.clone(),
            description: target.description.clone(),
            publisher: target.publisher.clone(),
            authors: target.authors.clone(),
            tags: target.tags.clone(),
            embedding,
        }
    }

    pub fn document_id(&self) -> String {
        self.book_id.to_string()
    }
}
