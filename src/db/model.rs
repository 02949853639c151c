//! Row and view models returned by the repositories.
//!
//! Keep these structs focused on the data returned by queries. Pipeline
//! logic lives in `enrichment` and `embedding`.

use crate::model::{Stage, StageStatus};

/// Full batch record, mostly for reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecordRow {
    pub id: i64,
    pub book_id: i64,
    pub enrichment_status: StageStatus,
    pub enrichment_retry_count: i64,
    pub enrichment_error: Option<String>,
    pub embedding_status: StageStatus,
    pub embedding_retry_count: i64,
    pub embedding_error: Option<String>,
}

/// Count of records per stage and status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub rows: Vec<(Stage, StageStatus, i64)>,
}

impl StageSummary {
    pub fn count(&self, stage: Stage, status: StageStatus) -> i64 {
        self.rows
            .iter()
            .find(|(s, st, _)| *s == stage && *st == status)
            .map(|(_, _, n)| *n)
            .unwrap_or(0)
    }
}

/// What one bulk-write transaction did to the batch records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl WriteOutcome {
    pub fn merge(&mut self, other: WriteOutcome) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}
