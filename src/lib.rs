pub mod cache;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrichment;
pub mod extract;
pub mod lookup;
pub mod model;
pub mod quota;
pub mod search;
