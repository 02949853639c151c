//! Database module: row models, SQL repositories and bulk-write phases.
//!
//! - `model`: row and view models returned by repositories.
//! - `repo`: pool setup, claims, single-row reads and reporting queries.
//! - `bulk`: the transactional write phases of both pipeline stages.
//!
//! External modules import from `catalog_enricher::db`; the repository API
//! is re-exported here.

pub mod bulk;
pub mod model;
pub mod repo;

pub use bulk::{write_embedding_results, write_enrichment_chunk};
pub use model::{BatchRecordRow, StageSummary, WriteOutcome};
pub use repo::*;
